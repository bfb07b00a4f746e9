//! Graphloom Build - trigger handling and the build/update pipelines
//!
//! The [`BuildService`] is the write path of the whole system: it claims the
//! single build slot through the state store, then runs the pipeline
//! detached from the trigger response (fetch documents, extract atomic
//! facts, construct the graph, persist the snapshot, promote the version,
//! prune old snapshots). Any pipeline error lands on the task row and flips
//! the state to FAILED; the process keeps serving.

pub mod service;

pub use service::{generate_version_ms, BuildService, TriggerError, TriggerResult};
