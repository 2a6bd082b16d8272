//! Integration tests for the Ralph CLI
//!
//! Every test points `RALPH_HOME` at a temp directory. Tests that run a
//! loop put a scripted `claude` stand-in first on `PATH`.

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use ralph::config::RalphPaths;
use ralph::r#loop::{LoopKind, LoopState};
use ralph::session::{FileStateStore, StateStore};

/// Get a Command for the ralph binary with an isolated home.
fn ralph(home: &TempDir) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("ralph"));
    cmd.env("RALPH_HOME", home.path())
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

fn store_for(home: &TempDir, target: &TempDir) -> FileStateStore {
    FileStateStore::for_target(&RalphPaths::new(home.path()), target.path())
}

#[test]
fn test_help() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Supervised autonomous coding loops"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("spec"));
}

#[test]
fn test_version() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_config_path() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings.json"));
}

#[test]
fn test_config_show_defaults() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"context_limit\""))
        .stdout(predicate::str::contains("\"auto_gutter\": true"));
}

#[test]
fn test_config_show_reads_settings() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("settings.json"),
        r#"{"max_iterations": 42, "loop_model": "haiku"}"#,
    )
    .unwrap();

    ralph(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_iterations\": 42"))
        .stdout(predicate::str::contains("\"loop_model\": \"haiku\""));
}

#[test]
fn test_config_validate_accepts_missing_file() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Settings are valid"));
}

#[test]
fn test_config_validate_rejects_bad_threshold() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("settings.json"),
        r#"{"rotate_threshold": 1.5}"#,
    )
    .unwrap();

    ralph(&home)
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("rotate_threshold"));
}

#[test]
fn test_config_validate_rejects_malformed_json() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("settings.json"), "{not json").unwrap();

    ralph(&home).args(["config", "validate"]).assert().code(7);
}

#[test]
fn test_status_without_state() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    ralph(&home)
        .arg("status")
        .arg(target.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved loop state"));
}

#[test]
fn test_status_shows_paused_run() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    store_for(&home, &target)
        .save(&LoopState::paused(3, 10, LoopKind::Linting).with_task("T-2", "Add parser"))
        .unwrap();

    ralph(&home)
        .arg("status")
        .arg(target.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("paused"))
        .stdout(predicate::str::contains("3/10"))
        .stdout(predicate::str::contains("linting"))
        .stdout(predicate::str::contains("T-2 Add parser"))
        .stdout(predicate::str::contains("--resume"));
}

#[test]
fn test_clear_removes_state() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let store = store_for(&home, &target);
    store.save(&LoopState::paused(2, 5, LoopKind::Default)).unwrap();

    ralph(&home)
        .arg("clear")
        .arg(target.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared loop state"));

    assert!(store.load().unwrap().is_none());

    ralph(&home)
        .arg("clear")
        .arg(target.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved loop state"));
}

#[test]
fn test_run_missing_target() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    ralph(&home)
        .arg("run")
        .arg(target.path().join("does-not-exist"))
        .arg("--no-keys")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_run_without_engine_cli() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let empty = TempDir::new().unwrap();

    ralph(&home)
        .env("PATH", empty.path())
        .arg("run")
        .arg(target.path())
        .arg("--no-keys")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("claude"));
}

#[test]
fn test_run_rejects_invalid_settings() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    std::fs::write(home.path().join("settings.json"), r#"{"max_iterations": 0}"#).unwrap();

    ralph(&home)
        .arg("run")
        .arg(target.path())
        .arg("--no-keys")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("max_iterations"));
}

#[cfg(unix)]
#[test]
fn test_run_rejects_zero_iterations() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::COMPLETES);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["-n", "0", "--no-keys"])
        .assert()
        .code(7);
}

#[test]
fn test_once_and_resume_conflict() {
    let home = TempDir::new().unwrap();
    ralph(&home)
        .args(["run", ".", "--once", "--resume"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[cfg(unix)]
mod engine {
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Reads the initialize request and the instruction, answers, then
    /// waits for stdin to close.
    fn script(reply: &str) -> String {
        format!("#!/bin/sh\nread init\nread instruction\ncat <<'EOF'\n{reply}\nEOF\ncat > /dev/null\n")
    }

    pub const COMPLETES: &str = concat!(
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done <promise>COMPLETE</promise>"}]}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","is_error":false,"result":"Done <promise>COMPLETE</promise>","num_turns":1,"duration_ms":5,"total_cost_usd":0.01,"usage":{"input_tokens":100,"output_tokens":20}}"#,
    );

    pub const SPEC_COMPLETES: &str = concat!(
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"PRD written <promise>SPEC_COMPLETE</promise>"}]}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","is_error":false,"result":"PRD written <promise>SPEC_COMPLETE</promise>","num_turns":1,"duration_ms":5,"total_cost_usd":0.01,"usage":{"input_tokens":100,"output_tokens":20}}"#,
    );

    pub const FAILS: &str = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"boom","num_turns":1,"duration_ms":5,"total_cost_usd":0.0,"usage":{"input_tokens":10,"output_tokens":0}}"#;

    pub fn install(bin: &TempDir, reply: &str) {
        let path = bin.path().join("claude");
        std::fs::write(&path, script(reply)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn path_with(bin: &TempDir) -> String {
        let inherited = std::env::var("PATH").unwrap_or_default();
        format!("{}:{inherited}", bin.path().display())
    }
}

#[cfg(unix)]
#[test]
fn test_run_once_completes() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::COMPLETES);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["--once", "--no-keys"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed after 1 iteration(s)"));

    assert!(store_for(&home, &target).load().unwrap().is_none());
}

#[cfg(unix)]
#[test]
fn test_run_loop_completes_and_logs() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::COMPLETES);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["-n", "5", "--project", "alpha", "--no-keys"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed after 1 iteration(s)"));

    let workspace = RalphPaths::new(home.path()).workspace_dir(target.path(), Some("alpha"));
    let log = std::fs::read_to_string(workspace.join("raw_output.log")).unwrap();
    assert!(log.contains("<promise>COMPLETE</promise>"));
}

#[cfg(unix)]
#[test]
fn test_run_error_saves_failed_iteration() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::FAILS);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["-n", "3", "--no-keys"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("errored"))
        .stdout(predicate::str::contains("--resume"));

    let saved = store_for(&home, &target).load().unwrap().expect("saved state");
    assert_eq!(saved.iteration, 1);
    assert_eq!(saved.total_iterations, 3);
    assert!(saved.is_resumable());
}

#[cfg(unix)]
#[test]
fn test_run_resume_continues_saved_run() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::COMPLETES);
    let store = store_for(&home, &target);
    store.save(&LoopState::paused(4, 6, LoopKind::Entropy)).unwrap();

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["--resume", "--no-keys"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Resuming at iteration 4/6"))
        .stdout(predicate::str::contains("completed"));

    assert!(store.load().unwrap().is_none());
}

#[cfg(unix)]
#[test]
fn test_run_resume_without_state_starts_fresh() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::COMPLETES);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("run")
        .arg(target.path())
        .args(["--resume", "--no-keys"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to resume"));
}

#[cfg(unix)]
#[test]
fn test_spec_completes() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::SPEC_COMPLETES);

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("spec")
        .arg(target.path())
        .args(["--topic", "a todo CLI", "-n", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Spec complete"));
}

#[cfg(unix)]
#[test]
fn test_spec_copies_requirements_file() {
    let home = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    engine::install(&bin, engine::SPEC_COMPLETES);
    let requirements = target.path().join("REQS.md");
    std::fs::write(&requirements, "# Must have a parser").unwrap();

    ralph(&home)
        .env("PATH", engine::path_with(&bin))
        .arg("spec")
        .arg(target.path())
        .arg("--requirements")
        .arg(&requirements)
        .assert()
        .success();

    let workspace = RalphPaths::new(home.path()).workspace_dir(target.path(), None);
    let copy = std::fs::read_to_string(workspace.join("requirements.md")).unwrap();
    assert_eq!(copy, "# Must have a parser");
}
