//! CLI smoke tests; task commands run without a container engine

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("dockhand.yml");
        let tasks = dir.path().join("tasks.json");
        std::fs::write(
            &config,
            format!(
                "containers:\n  - name: web\n    engine-id: web-1\n  - name: db\nscheduler:\n  tasks-file: {}\n",
                tasks.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn dh(&self) -> Command {
        let mut cmd = Command::cargo_bin("dh").unwrap();
        cmd.current_dir(self.dir.path())
            .env("HOME", self.dir.path())
            .env("XDG_DATA_HOME", self.dir.path().join("data"))
            .arg("-c")
            .arg(&self.config);
        cmd
    }

    fn tasks_file(&self) -> PathBuf {
        self.dir.path().join("tasks.json")
    }
}

/// The `tasks` array of the tasks file
fn read(path: &Path) -> serde_json::Value {
    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    doc["tasks"].clone()
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("dh")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("restart"))
        .stdout(predicate::str::contains("task"));
}

#[test]
fn test_task_add_and_list() {
    let sandbox = Sandbox::new();

    sandbox
        .dh()
        .args(["task", "add", "web", "restart", "--cycle", "daily", "--time", "04:30", "--tz", "Europe/Berlin"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled"));

    let stored = read(&sandbox.tasks_file());
    assert_eq!(stored.as_array().unwrap().len(), 1);
    assert_eq!(stored[0]["container"], "web");
    assert_eq!(stored[0]["timezone"], "Europe/Berlin");

    sandbox
        .dh()
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web"))
        .stdout(predicate::str::contains("daily at 04:30"));

    let output = sandbox
        .dh()
        .args(["--format", "json", "task", "list", "--filter", "active"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed[0]["action"], "restart");
    assert_eq!(listed[0]["cycle"]["kind"], "daily");
}

#[test]
fn test_task_disable_enable_rm() {
    let sandbox = Sandbox::new();
    sandbox
        .dh()
        .args(["task", "add", "db", "stop", "--cycle", "cron", "--cron", "0 2 * * 1-5"])
        .assert()
        .success();

    let id = read(&sandbox.tasks_file())[0]["id"].as_str().unwrap().to_string();
    let prefix = &id[..8];

    sandbox.dh().args(["task", "disable", prefix]).assert().success();
    assert_eq!(read(&sandbox.tasks_file())[0]["is_active"], false);

    sandbox.dh().args(["task", "enable", prefix]).assert().success();
    assert_eq!(read(&sandbox.tasks_file())[0]["is_active"], true);

    sandbox
        .dh()
        .args(["task", "rm", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted"));
    assert!(read(&sandbox.tasks_file()).as_array().unwrap().is_empty());

    sandbox
        .dh()
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No scheduled tasks"));
}

#[test]
fn test_task_add_rejects_bad_input() {
    let sandbox = Sandbox::new();

    sandbox
        .dh()
        .args(["task", "add", "ghost", "restart", "--time", "04:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown container: ghost"));

    sandbox
        .dh()
        .args(["task", "add", "web", "logs", "--time", "04:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be scheduled"));

    sandbox
        .dh()
        .args(["task", "add", "web", "restart", "--cycle", "weekly", "--time", "04:00"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--weekday"));

    sandbox
        .dh()
        .args(["task", "add", "web", "restart", "--time", "04:00", "--tz", "Mars/Base"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Mars/Base"));

    assert!(!sandbox.tasks_file().exists());
}

#[test]
fn test_unknown_format_rejected() {
    let sandbox = Sandbox::new();
    sandbox
        .dh()
        .args(["--format", "table", "task", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown format"));
}
