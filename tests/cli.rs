//! CLI tests: run the `docflow` binary against a temporary config.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn docflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docflow");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("memo.txt"),
        "The board approved the annual budget.\n\nSpending starts in March.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docflow.sqlite"

[blobs]
root = "{root}/data/blobs"

[queue]
max_attempts = 2
base_backoff_secs = 0.0
poll_interval_ms = 10

[pipeline]
follow_ups = {{}}
"#,
        root = root.display()
    );
    let config_path = config_dir.join("docflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docflow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docflow_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docflow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_ok(config_path: &Path, args: &[&str]) -> String {
    let (stdout, stderr, success) = run_docflow(config_path, args);
    assert!(
        success,
        "{:?} failed: stdout={}, stderr={}",
        args, stdout, stderr
    );
    stdout
}

/// Upload `files/memo.txt` and return the new document id.
fn upload_memo(config_path: &Path) -> String {
    let file = config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files/memo.txt");
    let stdout = run_ok(
        config_path,
        &["upload", "acme", file.to_str().unwrap(), "--user", "alice"],
    );
    assert!(stdout.contains("text/plain"), "{}", stdout);
    stdout
        .split_whitespace()
        .nth(1)
        .expect("document id after 'Uploaded'")
        .to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let stdout = run_ok(&config_path, &["init"]);
    assert!(stdout.contains("initialized"));
    run_ok(&config_path, &["init"]);
}

#[test]
fn test_missing_config_fails() {
    let (tmp, _) = setup_test_env();
    let (_, stderr, success) = run_docflow(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_ocr_then_review_flow() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    let doc_id = upload_memo(&config_path);

    let stdout = run_ok(&config_path, &["enqueue", "acme", &doc_id, "ocr"]);
    assert!(stdout.contains("Enqueued ocr job"));

    let stdout = run_ok(&config_path, &["work", "--once", "--task", "ocr"]);
    assert!(stdout.contains("acked 1"), "{}", stdout);

    let stdout = run_ok(&config_path, &["status", "acme", &doc_id]);
    assert!(stdout.contains("[completed]"), "{}", stdout);
    assert!(stdout.contains("ocr"));

    let stdout = run_ok(&config_path, &["result", "acme", &doc_id, "ocr"]);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(result["effective"]["text"]
        .as_str()
        .unwrap()
        .contains("annual budget"));
    assert_eq!(result["review_state"], "extracted");

    let stdout = run_ok(
        &config_path,
        &[
            "review", "acme", &doc_id, "ocr", "--user", "bob", "correct", "text",
            "Budget approved.",
        ],
    );
    assert!(stdout.contains("is now reviewed"), "{}", stdout);
    let stdout = run_ok(
        &config_path,
        &["review", "acme", &doc_id, "ocr", "--user", "bob", "validate"],
    );
    assert!(stdout.contains("is now validated"), "{}", stdout);

    // Validated results are frozen.
    let (_, _, success) = run_docflow(
        &config_path,
        &["review", "acme", &doc_id, "ocr", "--user", "bob", "reject", "typo"],
    );
    assert!(!success);

    let stdout = run_ok(&config_path, &["audit", "acme", "--document", &doc_id]);
    assert!(stdout.contains("document_uploaded"));
    assert!(stdout.contains("result_corrected"));
    assert!(stdout.contains("result_validated"));
}

#[test]
fn test_other_tenant_cannot_see_document() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    let doc_id = upload_memo(&config_path);

    let (_, stderr, success) = run_docflow(&config_path, &["status", "globex", &doc_id]);
    assert!(!success);
    assert!(stderr.contains("not found"), "{}", stderr);
}

#[test]
fn test_indexing_without_embedder_is_dead_lettered() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    let doc_id = upload_memo(&config_path);
    run_ok(&config_path, &["enqueue", "acme", &doc_id, "indexing"]);

    let stdout = run_ok(&config_path, &["work", "--once", "--task", "indexing"]);
    assert!(stdout.contains("dead-lettered 1"), "{}", stdout);

    let stdout = run_ok(&config_path, &["dlq", "list", "acme"]);
    let letters: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(letters.as_array().unwrap().len(), 1);
    assert_eq!(letters[0]["task_type"], "indexing");

    let stdout = run_ok(&config_path, &["dlq", "list", "globex"]);
    assert_eq!(stdout.trim(), "[]");
}

#[test]
fn test_query_requires_embedding_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    let (_, _, success) = run_docflow(&config_path, &["query", "acme", "what was approved?"]);
    assert!(!success);
}

#[test]
fn test_unknown_task_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_ok(&config_path, &["init"]);
    let doc_id = upload_memo(&config_path);
    let (_, stderr, success) = run_docflow(&config_path, &["enqueue", "acme", &doc_id, "translate"]);
    assert!(!success);
    assert!(stderr.contains("translate"), "{}", stderr);
}
