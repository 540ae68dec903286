#![allow(missing_docs)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = dir.path().join("config.toml");
        fs::write(&config, "[logging]\nlevel = \"warn\"\n").expect("write config");
        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn seeded(&self, name: &str) -> (PathBuf, String) {
        let path = self.path(name);
        let cache = common::open_sqlite(&path);
        let id = common::seed(&cache, &common::scenario());
        (path, id.to_string())
    }

    fn run_json(&self, cache: &Path, args: &[&str]) -> Value {
        let output = cargo_bin_cmd!("sombra-transport")
            .arg("--config")
            .arg(&self.config)
            .arg("--cache")
            .arg(cache)
            .args(["--format", "json"])
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).expect("valid json")
    }
}

#[test]
fn stats_counts_records_by_type() {
    let ws = Workspace::new();
    let (cache, _) = ws.seeded("stats.db");

    let json = ws.run_json(&cache, &["stats"]);
    assert_eq!(json["cache"]["records"].as_u64(), Some(2));
    assert_eq!(json["cache"]["types"]["A"].as_u64(), Some(1));
    assert_eq!(json["cache"]["types"]["B"].as_u64(), Some(1));
    assert!(json["filesystem"]["db_size_bytes"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn list_prints_every_record() {
    let ws = Workspace::new();
    let (cache, root) = ws.seeded("list.db");

    let json = ws.run_json(&cache, &["list"]);
    let entries = json.as_array().expect("array");
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .any(|entry| entry["id"] == root.as_str() && entry["speckle_type"] == "A"));

    let limited = ws.run_json(&cache, &["list", "--limit", "1"]);
    assert_eq!(limited.as_array().map(Vec::len), Some(1));
}

#[test]
fn get_returns_the_stored_record() {
    let ws = Workspace::new();
    let (cache, root) = ws.seeded("get.db");

    let json = ws.run_json(&cache, &["get", &root]);
    assert_eq!(json["speckle_type"], "A");
    assert_eq!(json["id"], root.as_str());
    assert_eq!(json["name"], "root");
}

#[test]
fn get_missing_id_fails() {
    let ws = Workspace::new();
    let (cache, _) = ws.seeded("missing.db");

    cargo_bin_cmd!("sombra-transport")
        .arg("--config")
        .arg(&ws.config)
        .arg("--cache")
        .arg(&cache)
        .args(["get", "0123456789abcdef0123456789abcdef"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn commands_refuse_a_missing_cache() {
    let ws = Workspace::new();
    let absent = ws.path("absent.db");

    cargo_bin_cmd!("sombra-transport")
        .arg("--config")
        .arg(&ws.config)
        .arg("--cache")
        .arg(&absent)
        .arg("stats")
        .assert()
        .failure()
        .code(1);
    assert!(!absent.exists());
}

#[test]
fn verify_accepts_a_clean_cache() {
    let ws = Workspace::new();
    let (cache, _) = ws.seeded("clean.db");

    let json = ws.run_json(&cache, &["verify", "--level", "full"]);
    assert_eq!(json["success"], true);
    assert_eq!(json["counts"]["records_scanned"].as_u64(), Some(2));
    assert_eq!(json["counts"]["hash_mismatches"].as_u64(), Some(0));
}

#[test]
fn verify_flags_tampered_records() {
    let ws = Workspace::new();
    let (cache, _) = ws.seeded("tampered.db");
    {
        let conn = Connection::open(&cache).expect("raw connection");
        conn.execute(
            "INSERT INTO objects (id, content) VALUES (?1, ?2)",
            (
                "0000000000000000000000000000beef",
                r#"{"speckle_type":"B","value":3.0,"id":"0000000000000000000000000000beef"}"#,
            ),
        )
        .expect("insert tampered record");
    }

    let output = cargo_bin_cmd!("sombra-transport")
        .arg("--config")
        .arg(&ws.config)
        .arg("--cache")
        .arg(&cache)
        .args(["--format", "json", "verify"])
        .assert()
        .failure()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], false);
    assert_eq!(json["counts"]["hash_mismatches"].as_u64(), Some(1));
}

#[test]
fn pull_copies_a_graph_between_cache_files() {
    let ws = Workspace::new();
    let (source, root) = ws.seeded("source.db");
    let local = ws.path("local.db");

    let report = cargo_bin_cmd!("sombra-transport")
        .arg("--config")
        .arg(&ws.config)
        .arg("--cache")
        .arg(&local)
        .args(["--format", "json", "pull"])
        .arg(&source)
        .arg(&root)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&report).expect("valid json");
    assert_eq!(report["root_id"], root.as_str());
    assert_eq!(report["closure_size"].as_u64(), Some(1));

    let stats = ws.run_json(&local, &["stats"]);
    assert_eq!(stats["cache"]["records"].as_u64(), Some(2));
    let fetched = ws.run_json(&local, &["get", &root]);
    assert_eq!(fetched["speckle_type"], "A");
}
