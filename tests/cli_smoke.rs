use std::process::Command;

use tempfile::TempDir;

fn cortex(root: &std::path::Path, args: &[&str]) -> std::process::Output {
    let bin = env!("CARGO_BIN_EXE_cortex");
    Command::new(bin)
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("spawn cortex")
}

#[test]
fn status_on_uninitialized_project_reports_not_initialized() {
    let dir = TempDir::new().unwrap();
    let output = cortex(dir.path(), &["status", "--json"]);
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("status --json output is json");
    assert_eq!(parsed.get("initialized").and_then(|v| v.as_bool()), Some(false));
}

#[test]
fn init_creates_directory_layout_and_is_idempotent() {
    let dir = TempDir::new().unwrap();

    let output = cortex(dir.path(), &["init"]);
    assert!(output.status.success());
    assert!(dir.path().join(".cortex/chunks").is_dir());
    assert!(dir.path().join(".cortex/index").is_dir());
    assert!(dir.path().join(".cortex/memories").is_dir());

    let second = cortex(dir.path(), &["init"]);
    assert!(second.status.success());
    let stdout = String::from_utf8(second.stdout).unwrap();
    assert!(stdout.contains("already initialized"));
}

#[test]
fn status_after_init_reports_initialized_and_empty() {
    let dir = TempDir::new().unwrap();
    assert!(cortex(dir.path(), &["init"]).status.success());

    let output = cortex(dir.path(), &["status", "--json"]);
    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_str(&String::from_utf8(output.stdout).unwrap()).unwrap();
    assert_eq!(parsed.get("initialized").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        parsed
            .get("chunks")
            .and_then(|c| c.get("count"))
            .and_then(|v| v.as_u64()),
        Some(0)
    );
    assert_eq!(
        parsed
            .get("memories")
            .and_then(|c| c.get("count"))
            .and_then(|v| v.as_u64()),
        Some(0)
    );
}

#[test]
fn index_on_uninitialized_project_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let output = cortex(dir.path(), &["index"]);
    assert!(!output.status.success());
}

#[test]
fn memory_delete_of_unknown_id_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    assert!(cortex(dir.path(), &["init"]).status.success());

    let output = cortex(dir.path(), &["memory", "delete", "MEM-2026-01-01-001"]);
    assert!(!output.status.success());
}
