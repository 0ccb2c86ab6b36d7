//! Diagnostic tracing for the orchestrator.
//!
//! Spans and events from rounds, polls and scheduler calls go to stderr,
//! filtered by `RUST_LOG`. Nothing here is persisted: the durable record of a
//! run is its job directory (scripts, per-index outputs, `*.tasks` snapshots,
//! `_aggregated.json`). Stdout is reserved for operator-facing reports and
//! confirmation prompts, so redirecting it never mixes in log lines.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `RUST_LOG` filter (default `warn`),
/// compact lines on stderr.
///
/// ```bash
/// RUST_LOG=orchestrator=info orchestrator demo --mode cluster
/// RUST_LOG=orchestrator::io::scheduler=debug orchestrator rerun jobs/job_script.sbatch 3,7
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
