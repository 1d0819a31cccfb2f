//! queryhub-core — query compilation, transform pipeline, execution routing,
//! and incremental sync engine for a self-serve analytics backend.
//!
//! This crate is the transport-neutral core consumed by an HTTP layer,
//! authentication, and dashboard persistence that live outside this
//! repository (see spec.md §1). It compiles declarative chart/pivot/distinct/
//! period-total requests into dialect-specific SQL, executes them against an
//! embedded columnar store or pooled remote engines, and drives watermark and
//! snapshot sync jobs against those same backends.

pub mod config;
pub mod core;
pub mod error;
pub mod exec;
pub mod model;
pub mod sql;
pub mod store;
pub mod sync;

pub use error::{EngineError, ErrorKind};
