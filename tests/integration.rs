use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use walkdir::WalkDir;

fn sarc_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sarc");
    path
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    archive: PathBuf,
    config_path: PathBuf,
}

impl TestEnv {
    fn workspace(&self) -> PathBuf {
        self.root.join("ws")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.workspace().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let archive = root.join("archive");

    let config_content = format!(
        r#"[archive]
root = "{}"

[search]
default_limit = 20

[ingest]
mode = "off"
"#,
        archive.display()
    );
    let config_path = root.join("sarc.toml");
    fs::write(&config_path, config_content).unwrap();

    let env = TestEnv {
        _tmp: tmp,
        root,
        archive,
        config_path,
    };
    env.write("plans/todo.md", "# Todo\n\nfix login bug\n");
    env.write("context/notes.md", "session cookies expire after 15 minutes\n");
    env
}

fn run_sarc(env: &TestEnv, args: &[&str]) -> (String, String, i32) {
    let binary = sarc_binary();
    let output = Command::new(&binary)
        .current_dir(&env.root)
        .env_remove("SCRATCH_ARCHIVE_BASE")
        .env_remove("SCRATCH_ARCHIVE_LOG")
        .arg("--config")
        .arg(env.config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sarc binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code().unwrap_or(-1))
}

fn archive(env: &TestEnv, timestamp: &str) {
    let ws = env.workspace();
    let (stdout, stderr, code) = run_sarc(
        env,
        &[
            "archive",
            ws.to_str().unwrap(),
            "--project",
            "demo",
            "--timestamp",
            timestamp,
        ],
    );
    assert_eq!(code, 0, "archive failed: stdout={}, stderr={}", stdout, stderr);
}

fn ingest(env: &TestEnv) {
    let (stdout, stderr, code) = run_sarc(env, &["ingest", "--project", "demo"]);
    assert_eq!(code, 0, "ingest failed: stdout={}, stderr={}", stdout, stderr);
}

fn search_json(env: &TestEnv, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["search"];
    full.extend_from_slice(args);
    full.push("--json");
    let (stdout, stderr, code) = run_sarc(env, &full);
    assert_eq!(code, 0, "search failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

fn tree_checksum(dir: &Path) -> String {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.unwrap();
        hasher.update(entry.path().to_string_lossy().as_bytes());
        if entry.file_type().is_symlink() {
            hasher.update(fs::read_link(entry.path()).unwrap().to_string_lossy().as_bytes());
        } else if entry.file_type().is_file() {
            hasher.update(fs::read(entry.path()).unwrap());
        }
    }
    format!("{:x}", hasher.finalize())
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env();

    let (stdout, stderr, code) = run_sarc(&env, &["init"]);
    assert_eq!(code, 0, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.archive.join("archives.db").is_file());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env();

    let (_, _, first) = run_sarc(&env, &["init"]);
    assert_eq!(first, 0, "First init failed");
    let (_, _, second) = run_sarc(&env, &["init"]);
    assert_eq!(second, 0, "Second init failed (not idempotent)");
}

#[test]
fn test_archive_creates_snapshot_and_latest() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");

    let snapshot = env.archive.join("demo/20260101_090000");
    assert_eq!(
        fs::read_to_string(snapshot.join("plans/todo.md")).unwrap(),
        "# Todo\n\nfix login bug\n"
    );
    assert!(snapshot.join(".scratch-index").is_file());
    assert_eq!(
        fs::read_link(env.archive.join("demo/latest")).unwrap(),
        PathBuf::from("20260101_090000")
    );
}

#[test]
fn test_archive_collision_fails_and_keeps_latest() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    archive(&env, "20260101_100000");

    let ws = env.workspace();
    let (_, stderr, code) = run_sarc(
        &env,
        &[
            "archive",
            ws.to_str().unwrap(),
            "--project",
            "demo",
            "--timestamp",
            "20260101_090000",
        ],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("already exists"), "stderr={}", stderr);
    assert_eq!(
        fs::read_link(env.archive.join("demo/latest")).unwrap(),
        PathBuf::from("20260101_100000")
    );
}

#[test]
fn test_archive_missing_source_is_not_found() {
    let env = setup_test_env();
    let (_, _, code) = run_sarc(&env, &["archive", "does-not-exist", "--project", "demo"]);
    assert_eq!(code, 2);
    assert!(!env.archive.join("demo").exists());
}

#[test]
fn test_search_finds_archived_line() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    ingest(&env);

    let result = search_json(&env, &["login bug", "-p", "demo"]);
    assert_eq!(result["backend"], "index");
    let hits = result["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["dir_type"], "plans");
    assert_eq!(hits[0]["path"], "plans/todo.md");
    assert_eq!(hits[0]["line_or_field"], "3");
    assert!(hits[0]["score"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_search_nonexistent_term_is_empty() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    ingest(&env);

    let result = search_json(&env, &["nonexistent-term"]);
    assert!(result["hits"].as_array().unwrap().is_empty());

    let (stdout, _, code) = run_sarc(&env, &["search", "nonexistent-term"]);
    assert_eq!(code, 0);
    assert!(!stdout.contains("plans/todo.md"));
}

#[test]
fn test_search_domain_fields() {
    let env = setup_test_env();
    env.write(
        "domains/auth.json",
        r#"{"gotchas": ["refresh tokens rotate on every login"], "key_files": [{"path": "src/session.rs", "purpose": "cookie handling"}]}"#,
    );
    archive(&env, "20260101_090000");
    ingest(&env);

    let result = search_json(&env, &["cookie", "-t", "domains"]);
    let hits = result["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["line_or_field"], "key_files[0].purpose");
}

#[test]
fn test_latest_only_excludes_older_snapshots() {
    let env = setup_test_env();
    env.write("plans/todo.md", "migrate cache layer v1\n");
    archive(&env, "20260101_090000");
    env.write("plans/todo.md", "migrate cache layer v2\n");
    archive(&env, "20260101_100000");
    ingest(&env);

    let all = search_json(&env, &["migrate cache", "-p", "demo"]);
    assert_eq!(all["hits"].as_array().unwrap().len(), 2);
    // equal relevance is broken by recency
    assert_eq!(all["hits"][0]["timestamp"], "20260101_100000");

    let latest = search_json(&env, &["migrate cache", "-p", "demo", "--latest"]);
    let hits = latest["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["timestamp"], "20260101_100000");
}

#[test]
fn test_ingest_idempotent() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    ingest(&env);
    let first = search_json(&env, &["login"]);
    let (stats1, _, _) = run_sarc(&env, &["stats", "--json"]);

    ingest(&env);
    let second = search_json(&env, &["login"]);
    let (stats2, _, _) = run_sarc(&env, &["stats", "--json"]);

    assert_eq!(first, second);
    let s1: serde_json::Value = serde_json::from_str(&stats1).unwrap();
    let s2: serde_json::Value = serde_json::from_str(&stats2).unwrap();
    assert_eq!(s1["total_records"], s2["total_records"]);
    assert_eq!(s1["total_records"], 3);
}

#[test]
fn test_ingest_keeps_other_projects() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    let ws = env.workspace();
    let (_, _, code) = run_sarc(
        &env,
        &["archive", ws.to_str().unwrap(), "--project", "other", "--timestamp", "20260101_090000"],
    );
    assert_eq!(code, 0);

    let (_, _, code) = run_sarc(&env, &["ingest"]);
    assert_eq!(code, 0);
    ingest(&env);

    let result = search_json(&env, &["login bug"]);
    assert_eq!(result["hits"].as_array().unwrap().len(), 2);
}

#[test]
fn test_ingest_unknown_project_is_not_found() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    let (_, _, code) = run_sarc(&env, &["ingest", "--project", "ghost"]);
    assert_eq!(code, 2);
}

#[test]
fn test_ingest_full_rejects_project() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    let (_, stderr, code) = run_sarc(&env, &["ingest", "--project", "demo", "--full"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("cannot be used with"), "stderr={}", stderr);
}

#[test]
fn test_worker_mode_reports_then_drains() {
    let env = setup_test_env();
    let config = fs::read_to_string(&env.config_path)
        .unwrap()
        .replace(r#"mode = "off""#, r#"mode = "worker""#);
    fs::write(&env.config_path, config).unwrap();

    let ws = env.workspace();
    let (stdout, stderr, code) = run_sarc(
        &env,
        &["archive", ws.to_str().unwrap(), "--project", "demo", "--timestamp", "20260101_090000"],
    );
    assert_eq!(code, 0, "archive failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("Archived demo/20260101_090000"), "stdout={}", stdout);
    assert!(stdout.contains("Index update queued for demo."));

    // the worker finished its queue before the process exited
    let result = search_json(&env, &["login bug"]);
    assert_eq!(result["backend"], "index");
    assert_eq!(result["hits"].as_array().unwrap().len(), 1);
}

#[test]
fn test_ingest_partial_on_malformed_json() {
    let env = setup_test_env();
    env.write("domains/broken.json", "{ not json");
    archive(&env, "20260101_090000");

    let (stdout, stderr, code) = run_sarc(&env, &["ingest", "--project", "demo"]);
    assert_eq!(code, 3, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("skipped 1"));

    let result = search_json(&env, &["login bug"]);
    assert_eq!(result["hits"].as_array().unwrap().len(), 1);
}

#[test]
fn test_search_falls_back_without_index() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");

    let result = search_json(&env, &["login bug"]);
    assert_eq!(result["backend"], "flat-index");
    let hits = result["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["line_or_field"], "3");
}

#[test]
fn test_search_falls_back_on_corrupt_index() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    fs::write(env.archive.join("archives.db"), "this is not a database").unwrap();
    fs::remove_file(env.archive.join("demo/20260101_090000/.scratch-index")).unwrap();

    let result = search_json(&env, &["login bug"]);
    assert_eq!(result["backend"], "raw-scan");
    assert_eq!(result["hits"].as_array().unwrap().len(), 1);
}

#[test]
fn test_dedup_dry_run_changes_nothing() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    archive(&env, "20260101_100000");

    let before = tree_checksum(&env.archive);
    let (stdout, stderr, code) = run_sarc(&env, &["dedup", "demo", "--dry-run", "--json"]);
    assert_eq!(code, 0, "dedup failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(before, tree_checksum(&env.archive));

    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let moves = report["moves"].as_array().unwrap();
    assert_eq!(moves.len(), 2);
    assert!(moves.iter().all(|m| m["identical"] == true));
}

#[test]
fn test_dedup_moves_older_copy_to_review() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    archive(&env, "20260101_100000");

    let (stdout, stderr, code) = run_sarc(&env, &["dedup", "demo"]);
    assert_eq!(code, 0, "dedup failed: stdout={}, stderr={}", stdout, stderr);
    assert!(env
        .archive
        .join("demo/_review/20260101_090000/context/notes.md")
        .is_file());
    assert!(!env
        .archive
        .join("demo/20260101_090000/context/notes.md")
        .exists());

    ingest(&env);
    let result = search_json(&env, &["session cookies"]);
    let hits = result["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["timestamp"], "20260101_100000");

    let (stdout, _, code) = run_sarc(&env, &["dedup", "demo", "--json"]);
    assert_eq!(code, 0);
    let again: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(again["moves"].as_array().unwrap().is_empty());
}

#[test]
fn test_dedup_unknown_project_is_not_found() {
    let env = setup_test_env();
    let (_, _, code) = run_sarc(&env, &["dedup", "ghost", "--dry-run"]);
    assert_eq!(code, 2);
}

#[test]
fn test_list_marks_latest() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    archive(&env, "20260101_100000");

    let (stdout, _, code) = run_sarc(&env, &["list", "--json"]);
    assert_eq!(code, 0);
    let snapshots: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let snapshots = snapshots.as_array().unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0]["timestamp"], "20260101_100000");
    assert_eq!(snapshots[0]["is_latest"], true);
    assert_eq!(snapshots[1]["is_latest"], false);
}

#[test]
fn test_file_name_output() {
    let env = setup_test_env();
    archive(&env, "20260101_090000");
    ingest(&env);

    let (stdout, _, code) = run_sarc(&env, &["search", "login", "--file-name"]);
    assert_eq!(code, 0);
    assert!(stdout
        .trim()
        .ends_with("demo/20260101_090000/plans/todo.md:3"));
}

#[test]
fn test_completions() {
    let env = setup_test_env();
    let (stdout, _, code) = run_sarc(&env, &["completions", "bash"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("sarc"));
}
