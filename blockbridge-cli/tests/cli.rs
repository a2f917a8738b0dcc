use assert_cmd::Command;
use blockbridge_store::{queue, NewEntry, Store};
use blockbridge_types::{BlockId, ChangeType, QueueStatus};
use chrono::Utc;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

fn project() -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("blockbridge.yml"),
        "paths:\n  vault: vault\n  database: state/sync.db\n",
    )
    .unwrap();
    fs::create_dir_all(dir.path().join("vault")).unwrap();
    dir
}

#[allow(deprecated)]
fn blockbridge(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("blockbridge").unwrap();
    cmd.current_dir(dir)
        .env_remove("NOTION_API_KEY")
        .env_remove("RUST_LOG");
    cmd
}

/// Seed one failed entry straight into the database.
fn seed_failed_entry(dir: &Path) -> i64 {
    let store = Store::open(&dir.join("state/sync.db")).unwrap();
    store
        .transaction(|c| {
            let entry = NewEntry::to_remote(
                "cave.md",
                &BlockId::new("b1"),
                ChangeType::Insert,
                json!({ "kind": "block" }),
            );
            let id = queue::enqueue(c, &entry, Utc::now())?;
            let claimed = queue::dequeue_next(c, Some("cave.md"))?;
            assert_eq!(claimed.map(|e| e.id), Some(id));
            queue::mark_failed(c, id, "remote said no", false)?;
            Ok(id)
        })
        .unwrap()
}

#[test]
fn parse_lists_blocks_and_variables() {
    let dir = project();
    fs::write(
        dir.path().join("cave.md"),
        "# Cave\n\nA damp cave.\n\n```state\n$hp = 100\n```\n",
    )
    .unwrap();

    blockbridge(dir.path())
        .args(["parse", "cave.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("heading1"))
        .stdout(predicate::str::contains("A damp cave."))
        .stdout(predicate::str::contains("hp: number"));
}

#[test]
fn parse_json_reports_bindings() {
    let dir = project();
    fs::write(
        dir.path().join("world.md"),
        "---\ndata:\n  db:\n    provider: sqlite\n    path: ./data/world.db\n    namespace: $db\n    bind:\n      - var: $db.npc[*].name\n---\n\nHello\n",
    )
    .unwrap();

    let output = blockbridge(dir.path())
        .args(["parse", "world.md", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["bindings"][0]["connection_path"], "./data/world.db");
    assert_eq!(body["bindings"][0]["namespace"], "$db");
    assert_eq!(body["blocks"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"].as_array().unwrap().len(), 0);
}

#[test]
fn parse_fails_on_malformed_blocks() {
    let dir = project();
    fs::write(
        dir.path().join("bad.md"),
        "Fine\n\n```map\nviewport: wide\n```\n",
    )
    .unwrap();

    blockbridge(dir.path())
        .args(["parse", "bad.md"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Fine"))
        .stderr(predicate::str::contains("malformed `map` block"));
}

#[test]
fn status_on_a_fresh_project() {
    let dir = project();
    let output = blockbridge(dir.path()).arg("status").output().unwrap();
    assert!(output.status.success());
    insta::assert_snapshot!(String::from_utf8_lossy(&output.stdout), @r"
    pending     0
    processing  0
    success     0
    error       0
    conflict    0
    total       0
    ");
}

#[test]
fn missing_config_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    blockbridge(dir.path())
        .args(["--config", "absent.yml", "status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 0"));
    assert!(dir.path().join(".blockbridge/sync.db").exists());
}

#[test]
fn retry_requeues_failed_entries() {
    let dir = project();
    let id = seed_failed_entry(dir.path());

    blockbridge(dir.path())
        .args(["queue", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("remote said no"));

    blockbridge(dir.path())
        .args(["retry", &id.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("requeued"));

    let store = Store::open(&dir.path().join("state/sync.db")).unwrap();
    let entry = store.read(|c| queue::get(c, id)).unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);

    // Only failed entries can be retried
    blockbridge(dir.path())
        .args(["retry", &id.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot move"));
}

#[test]
fn retry_unknown_entry_fails() {
    let dir = project();
    blockbridge(dir.path())
        .args(["retry", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn changes_lists_new_documents() {
    let dir = project();
    fs::create_dir_all(dir.path().join("vault/quests")).unwrap();
    fs::write(dir.path().join("vault/quests/cave.md"), "# Cave\n").unwrap();
    fs::write(dir.path().join("vault/readme.txt"), "ignored").unwrap();

    blockbridge(dir.path())
        .arg("changes")
        .assert()
        .success()
        .stdout(predicate::str::contains("new       quests/cave.md"))
        .stdout(predicate::str::contains("readme").not());
}

#[test]
fn maps_is_empty_before_any_sync() {
    let dir = project();
    blockbridge(dir.path())
        .args(["maps", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn clear_reports_removed_entries() {
    let dir = project();
    blockbridge(dir.path())
        .args(["clear", "--keep-days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0"));
}

#[test]
fn push_requires_an_api_key() {
    let dir = project();
    fs::write(dir.path().join("vault/cave.md"), "# Cave\n").unwrap();
    blockbridge(dir.path())
        .args(["push", "cave.md", "--page", "page-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NOTION_API_KEY"));
}

#[test]
fn resolve_rejects_unknown_choices() {
    let dir = project();
    blockbridge(dir.path())
        .args(["resolve", "1", "--choice", "both"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
