//! Binary-level tests for the `dm` CLI.
//!
//! Only commands that never touch the network are exercised here; the sync
//! pipeline itself is covered against an in-memory wiki in
//! `sync_integration.rs`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dm_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dm");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let save_dir = root.join("wiki/AKS");
    fs::create_dir_all(save_dir.join("Networking")).unwrap();
    fs::write(
        save_dir.join("AKS.md"),
        "[View this page online](https://wiki.test/?pagePath=%2FAKS)\n\n# AKS",
    )
    .unwrap();
    fs::write(
        save_dir.join("Networking.md"),
        "[View this page online](https://wiki.test/?pagePath=%2FAKS%2FNetworking)\n\n# Networking",
    )
    .unwrap();
    fs::write(
        save_dir.join("Networking/DNS.md"),
        "[View this page online](https://wiki.test/?pagePath=%2FAKS%2FNetworking%2FDNS)\n\n# DNS",
    )
    .unwrap();

    fs::write(
        root.join("url_mapping.json"),
        r#"{"Networking.md": "[View this page online](https://wiki.test/?pagePath=%2FAKS%2FNetworking)"}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[remote]
organization = "contoso"
project = "Platform"
wiki = "Platform.wiki"

[sync]
root = "AKS"
save_dir = "{root}/wiki/AKS"

[upload]
ledger = "{root}/uploaded_files.json"

[citations]
format = "markdown"
url_mapping = "{root}/url_mapping.json"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docmirror.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dm(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dm_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dm binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_status_without_state() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dm(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("No sync state found"));
    assert!(stdout.contains("Files on disk: 3"));
}

#[test]
fn test_rebuild_state_then_status() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dm(&config_path, &["rebuild-state"]);
    assert!(success, "rebuild-state failed: {}", stderr);
    assert!(stdout.contains("files on disk: 3"));
    assert!(stdout.contains("mapped to pages: 3"));

    let state_path = tmp.path().join("wiki/AKS/download_progress.json");
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(state_path).unwrap()).unwrap();
    assert_eq!(state["downloaded_files"]["/AKS/Networking/DNS"], "existing_file");
    assert_eq!(state["rebuilt_from_existing"], true);
    assert_eq!(state["completed"], true);

    let (stdout, _, success) = run_dm(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Tracked:     3"));
    assert!(stdout.contains("rebuilt from files on disk"));
    assert!(!stdout.contains("Warning"));
}

#[test]
fn test_rebuild_state_missing_save_dir() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_dir_all(tmp.path().join("wiki")).unwrap();

    let (_, stderr, success) = run_dm(&config_path, &["rebuild-state"]);
    assert!(!success);
    assert!(stderr.contains("save directory does not exist"));
}

#[test]
fn test_coverage_before_upload() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dm(&config_path, &["coverage"]);
    assert!(success, "coverage failed: {}", stderr);
    assert!(stdout.contains("Downloaded:  3"));
    assert!(stdout.contains("Uploaded:    0"));
    assert!(stdout.contains("Pending:     3"));
}

#[test]
fn test_upload_dry_run_lists_new_files() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dm(&config_path, &["upload", "--dry-run"]);
    assert!(success, "upload --dry-run failed: {}", stderr);
    assert!(stdout.contains("new: 3"));
    assert!(stdout.contains("Networking/DNS.md"));
    assert!(!tmp.path().join("uploaded_files.json").exists());
}

#[test]
fn test_sync_rejects_prefix_outside_root() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_dm(&config_path, &["sync", "--prefix", "/Other"]);
    assert!(!success);
    assert!(stderr.contains("outside the mirrored root"));
}

#[test]
fn test_cite_markdown() {
    let (tmp, config_path) = setup_test_env();
    let root = tmp.path();

    fs::write(
        root.join("answer.txt"),
        "Use Azure CNI【4:0†source】 and CoreDNS【4:1†source】 for names【4:2†source】.",
    )
    .unwrap();
    fs::write(
        root.join("annotations.json"),
        r#"[
            {"text": "【4:0†source】", "file_id": "file-net", "quote": "Azure CNI assigns pod IPs."},
            {"text": "【4:1†source】", "file_id": "file-dns"},
            {"text": "【4:2†source】", "file_id": "file-net"}
        ]"#,
    )
    .unwrap();
    fs::write(
        root.join("sources.json"),
        r#"{"file-net": "Networking.md", "file-dns": "DNS.md"}"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_dm(
        &config_path,
        &[
            "cite",
            root.join("answer.txt").to_str().unwrap(),
            root.join("annotations.json").to_str().unwrap(),
            "--sources",
            root.join("sources.json").to_str().unwrap(),
        ],
    );
    assert!(success, "cite failed: {}", stderr);
    assert!(stdout.starts_with("Use Azure CNI [0] and CoreDNS [1] for names [0]."));
    assert!(stdout.contains(
        "[0] [Networking](https://wiki.test/?pagePath=%2FAKS%2FNetworking)\n> Azure CNI assigns pod IPs."
    ));
    assert!(stdout.contains("[1] DNS"));
    assert!(!stdout.contains("[2]"));
}

#[test]
fn test_cite_html_override() {
    let (tmp, config_path) = setup_test_env();
    let root = tmp.path();
    fs::write(root.join("answer.txt"), "See here【1】.").unwrap();
    fs::write(
        root.join("annotations.json"),
        r#"[{"matched_text": "【1】", "source_id": "f1", "quote": "Document"}]"#,
    )
    .unwrap();
    fs::write(root.join("sources.json"), r#"{"f1": "Upgrade.md"}"#).unwrap();

    let (stdout, stderr, success) = run_dm(
        &config_path,
        &[
            "cite",
            root.join("answer.txt").to_str().unwrap(),
            root.join("annotations.json").to_str().unwrap(),
            "--sources",
            root.join("sources.json").to_str().unwrap(),
            "--format",
            "html",
        ],
    );
    assert!(success, "cite failed: {}", stderr);
    assert_eq!(
        stdout.trim_end(),
        "See here [0].<br><br><strong>Sources:</strong><br>[0] Upgrade"
    );
}

#[test]
fn test_missing_config_errors() {
    let (tmp, _) = setup_test_env();
    let (_, stderr, success) = run_dm(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
