//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod descriptor;
pub mod job_array;
pub mod reconcile;
pub mod status;
pub mod work_item;
