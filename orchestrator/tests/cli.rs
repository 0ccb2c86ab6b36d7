//! CLI tests for the job-directory maintenance commands.
//!
//! Spawns the orchestrator binary and checks exit codes and printed reports.

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

use orchestrator::exit_codes;
use orchestrator::io::cache::ResultCache;
use orchestrator::test_support::write_demo_job_dir;

fn orchestrator() -> Command {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
}

#[test]
fn missing_reports_indices_without_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = write_demo_job_dir(temp.path(), &["a", "b", "c"]);
    fs::write(dir.output_path(0), "a\n").expect("write");
    fs::write(dir.output_path(2), "").expect("write");

    let output = orchestrator()
        .current_dir(temp.path())
        .arg("missing")
        .arg(dir.submission_script_path())
        .output()
        .expect("orchestrator missing");

    assert_eq!(output.status.code(), Some(exit_codes::MISSING));
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert!(stdout.contains("1 missing indices: 1\n"));
    assert!(stdout.contains("2 missing or empty indices: 1,2\n"));
}

#[test]
fn missing_exits_ok_when_every_output_exists() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = write_demo_job_dir(temp.path(), &["a"]);
    fs::write(dir.output_path(0), "a\n").expect("write");

    let status = orchestrator()
        .current_dir(temp.path())
        .arg("missing")
        .arg(dir.submission_script_path())
        .status()
        .expect("orchestrator missing");

    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn absorb_folds_outputs_into_cache() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = write_demo_job_dir(temp.path(), &["a", "b"]);
    fs::write(dir.output_path(1), "b\n").expect("write");

    let status = orchestrator()
        .current_dir(temp.path())
        .arg("absorb")
        .arg(dir.root())
        .status()
        .expect("orchestrator absorb");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let cache = ResultCache::load(&dir.cache_path()).expect("cache");
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("echo b"), Some("b\n"));
}

#[test]
fn demo_print_only_lists_commands() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = orchestrator()
        .current_dir(temp.path())
        .args(["demo", "--mode", "print-only"])
        .output()
        .expect("orchestrator demo");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert_eq!(
        stdout.lines().collect::<Vec<_>>(),
        vec!["echo 0 'job finished'", "sleep 1", "echo 2 'job finished'"]
    );
    assert!(!temp.path().join("slurm_jobs").exists());
}

#[test]
fn rerun_rejects_malformed_index_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = write_demo_job_dir(temp.path(), &["a"]);

    let status = orchestrator()
        .current_dir(temp.path())
        .arg("rerun")
        .arg(dir.submission_script_path())
        .arg("1,x")
        .status()
        .expect("orchestrator rerun");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn rerun_shows_script_and_stops_when_declined() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = write_demo_job_dir(temp.path(), &["a", "b"]);
    fs::write(dir.output_path(1), "").expect("write");

    let mut child = orchestrator()
        .current_dir(temp.path())
        .arg("rerun")
        .arg(dir.submission_script_path())
        .arg("1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn orchestrator rerun");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"n\n")
        .expect("answer");
    let output = child.wait_with_output().expect("orchestrator rerun");

    assert_eq!(output.status.code(), Some(exit_codes::DECLINED));
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert!(stdout.contains("#SBATCH --array=1\n"));
    assert!(stdout.contains("Continue? [Y/YES/N/NO]"));
    assert!(dir.output_path(1).exists());
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("orchestrator.toml"), "max_retry_rounds = \"many\"\n")
        .expect("write");

    let status = orchestrator()
        .current_dir(temp.path())
        .args(["demo", "--mode", "print-only"])
        .status()
        .expect("orchestrator demo");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
