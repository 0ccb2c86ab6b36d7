//! I/O helpers for orchestration rounds.

pub mod cache;
pub mod clock;
pub mod config;
pub mod confirm;
pub mod fs_util;
pub mod job_dir;
pub mod process;
pub mod scheduler;
