//! Sync plane (spec.md §4.12–§4.14): watermark/snapshot copy engine, the
//! coordinator that sequences and locks tasks, and the HTTP-API ingest
//! connector.

pub mod coordinator;
pub mod engine;
pub mod ingest;
pub mod source;
