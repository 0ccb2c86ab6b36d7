//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded and every task completed.
pub const OK: i32 = 0;
/// Invalid arguments or configuration, or any other error.
pub const INVALID: i32 = 1;
/// The run finished but the operator accepted failed tasks.
pub const ACCEPTED_FAILURES: i32 = 2;
/// The operator declined a required confirmation.
pub const DECLINED: i32 = 3;
/// `orchestrator missing` found indices without output.
pub const MISSING: i32 = 4;
