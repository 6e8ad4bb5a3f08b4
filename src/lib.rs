//! Core library for the time-series telemetry pipeline: the ingest path
//! (queue, fd cache, sink fan-out, wire-protocol server), the on-disk tsfile
//! format and its background consolidation, and TDQL (tokenizer, RPN
//! compiler/evaluator, statement parser, aggregate functions) plus the
//! aggregation engine that executes parsed statements against tsfile data.

pub mod aggregate;
pub mod collect;
pub mod config;
pub mod error;
pub mod fdcache;
pub mod sink;
pub mod tdql;
pub mod timestamp;
pub mod tsfile;

pub use error::{CoreError, CoreResult};
