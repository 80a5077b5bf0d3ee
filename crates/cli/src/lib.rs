//! tracecheck: a one-shot verification harness for an LLM endpoint and its
//! telemetry pipeline.
//!
//! The binary is a thin wrapper around [`Harness`]; integration tests drive
//! the same type against in-process mock endpoints.

pub mod harness;

pub use harness::{
    FailureKind, Harness, HarnessError, HarnessOptions, Outcome, RunReport, exit_code,
};
