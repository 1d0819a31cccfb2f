//! Execution plane (spec.md §4.7–§4.11): result caching, throttling, routing
//! between the embedded store and pooled remote engines, and the engine/
//! store handles themselves.
//!
//! Data flow (spec.md §2): a compiled query passes through `cache` → `throttle`
//! → `router`, and `router` dispatches to either `pool` (remote engines) or
//! `embedded` (the shared columnar connection).

pub mod cache;
pub mod embedded;
pub mod pool;
pub mod router;
pub mod throttle;
