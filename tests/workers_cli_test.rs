use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn write_fake_tdl(bin_path: &Path) {
    let script = r#"#!/usr/bin/env bash
set -euo pipefail

if [[ "${1:-}" == "chat" && "${2:-}" == "export" ]]; then
  out=""
  while [[ $# -gt 0 ]]; do
    if [[ "$1" == "-o" ]]; then
      out="$2"
      shift
    fi
    shift
  done
  echo '{"id": 1, "messages": [{"id": 10, "date": 1700000000, "text": "from worker"}]}' > "$out"
  exit 0
fi

exit 0
"#;
    fs::write(bin_path, script).expect("write fake tdl");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(bin_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(bin_path, perms).expect("chmod");
    }
}

struct Vault {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    home: PathBuf,
    tdl: PathBuf,
}

fn vault() -> Vault {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let home = root.join("vault");
    fs::create_dir_all(&home).expect("mkdir vault");
    let tdl = root.join("tdl");
    write_fake_tdl(&tdl);
    Vault {
        _tmp: tmp,
        root,
        home,
        tdl,
    }
}

fn cmd(v: &Vault) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("chat-vault");
    cmd.current_dir(&v.root)
        .env("VAULT_HOME", &v.home)
        .env("TDL_BIN", &v.tdl)
        .env("VAULT_LOG", "warn");
    cmd
}

fn spawn_workers(v: &Vault) -> Child {
    Command::new(env!("CARGO_BIN_EXE_chat-vault"))
        .current_dir(&v.root)
        .env("VAULT_HOME", &v.home)
        .env("TDL_BIN", &v.tdl)
        .env("VAULT_CAPTURE_INTERVAL_SECS", "3600")
        .env("VAULT_WORKERS_RECONCILE_SECS", "1")
        .env("VAULT_LOG", "warn")
        .args(["workers", "run"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn workers")
}

fn json_output(cmd: &mut assert_cmd::Command) -> Value {
    let out = cmd.output().expect("run");
    serde_json::from_slice(&out.stdout).expect("json report")
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

fn total(v: &Vault, source: &str) -> i64 {
    let page = json_output(cmd(v).args(["--json", "messages", source]));
    page["data"]["total"].as_i64().unwrap_or(0)
}

#[test]
fn workers_capture_reconcile_and_stop() {
    let v = vault();
    cmd(&v)
        .args(["sources", "add", "1", "--no-download"])
        .assert()
        .success();

    let mut workers = spawn_workers(&v);
    let enabled = wait_for(|| {
        let status = json_output(cmd(&v).args(["--json", "workers", "status"]));
        status["data"]["enabled"] == true
    });
    assert!(enabled, "workers never took the marker");
    assert!(wait_for(|| total(&v, "1") == 1), "first cycle never ran");

    // A second enable is refused while the marker is held.
    cmd(&v)
        .args(["workers", "run"])
        .assert()
        .code(2)
        .stdout(predicates::str::contains("already enabled"));

    // Sources added later are picked up by the reconcile loop.
    cmd(&v)
        .args(["sources", "add", "2", "--no-download"])
        .assert()
        .success();
    assert!(wait_for(|| total(&v, "2") == 1), "new source never captured");

    cmd(&v)
        .args(["workers", "stop"])
        .assert()
        .success()
        .stdout(predicates::str::contains("stopped workers pid="));
    let _ = workers.wait();

    let status = json_output(cmd(&v).args(["--json", "workers", "status"]));
    assert_eq!(status["data"]["enabled"], false);
    cmd(&v)
        .args(["workers", "stop"])
        .assert()
        .success()
        .stdout(predicates::str::contains("already stopped"));
}
