//! Batch-job orchestration for parameter-sweep experiments.
//!
//! An experiment routine emits independent command invocations through a
//! [`collect::CommandRunner`]. The same routine runs unchanged on this machine
//! or as one array job on a Slurm cluster, with results cached across runs.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (normalization, job arrays, script
//!   generation, status parsing, retry planning). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (config, child processes, scheduler
//!   commands, the job directory, the result cache, operator confirmation).
//!   Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`collect`], [`feed`], [`local`], [`distribute`],
//! [`rerun`]) coordinate core logic with I/O to implement the CLI commands.

pub mod collect;
pub mod core;
pub mod distribute;
pub mod error;
pub mod exit_codes;
pub mod feed;
pub mod io;
pub mod local;
pub mod logging;
pub mod rerun;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
