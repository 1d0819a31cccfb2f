//! SQL compilation layer (spec.md §4): identifier quoting, date-part
//! expressions, expression resolution, the transform composer, the query
//! compiler, and WHERE-clause planning. Each submodule is dialect-aware but
//! dialect-agnostic in its public API — the `Dialect` is always an explicit
//! argument, never inferred from context.

pub mod compiler;
pub mod dateparts;
pub mod quoter;
pub mod resolver;
pub mod transform;
pub mod where_planner;
