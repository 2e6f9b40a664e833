//! Session store walks against real temporary directory trees.

use std::fs;
use std::path::Path;

use waygate::session::SessionStore;

fn seed_session_tree(root: &Path) {
    fs::create_dir_all(root.join("app-state")).expect("create subdir");
    fs::write(root.join("creds.json"), r#"{"me":"5531987654321"}"#).expect("write creds");
    fs::write(root.join("session-5531987654321.0.json"), "{}").expect("write session");
    fs::write(root.join("session-4479111222333.0.json"), "{}").expect("write session");
    fs::write(root.join("pre-key-15.json"), "{}").expect("write pre-key");
    fs::write(root.join("sender-key-group1.json"), "{}").expect("write sender-key");
    // Content mentions the number, name does not.
    fs::write(
        root.join("app-state/sync-1.json"),
        r#"{"peer":"5531987654321@s.whatsapp.net"}"#,
    )
    .expect("write app-state");
}

#[test]
fn delete_by_number_matches_name_and_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_session_tree(dir.path());
    let store = SessionStore::new(dir.path());

    let deleted = store
        .delete_by_number("+55 (31) 98765-4321")
        .expect("reset should succeed");

    // Name match, content match, and the creds blob that mentions the
    // number in its content.
    assert_eq!(deleted, 3);
    assert!(!dir.path().join("session-5531987654321.0.json").exists());
    assert!(dir.path().join("session-4479111222333.0.json").exists());
    // The subdirectory lost its only file and was pruned.
    assert!(!dir.path().join("app-state").exists());
}

#[test]
fn delete_by_number_rejects_digitless_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());
    assert!(store.delete_by_number("not-a-number").is_err());
}

#[test]
fn delete_by_number_on_missing_directory_is_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("never-created"));
    let deleted = store.delete_by_number("5531987654321").expect("no-op reset");
    assert_eq!(deleted, 0);
}

#[test]
fn delete_by_patterns_spares_root_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_session_tree(dir.path());
    let store = SessionStore::new(dir.path());

    let deleted = store.delete_by_patterns().expect("prune should succeed");

    assert_eq!(deleted, 4);
    assert!(dir.path().join("creds.json").exists());
    assert!(dir.path().join("app-state/sync-1.json").exists());
    assert!(!dir.path().join("pre-key-15.json").exists());
    assert!(!dir.path().join("sender-key-group1.json").exists());
}

#[test]
fn clear_all_removes_directory_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("primary");
    fs::create_dir_all(&root).expect("create root");
    fs::write(root.join("creds.json"), "{}").expect("write creds");
    let store = SessionStore::new(&root);

    store.clear_all().expect("clear should succeed");
    assert!(!root.exists());

    // A second clear on the now-missing directory is a no-op.
    store.clear_all().expect("repeat clear should succeed");
}

#[test]
fn stale_ephemeral_pruning_respects_cutoff() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_session_tree(dir.path());
    let store = SessionStore::new(dir.path());

    // Cutoff in the past: nothing written just now qualifies.
    let old_cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(3_600))
        .expect("cutoff in range");
    assert_eq!(
        store.delete_stale_ephemeral(old_cutoff).expect("prune"),
        0
    );

    // Cutoff in the future: every ephemeral file is older than it.
    let future_cutoff = std::time::SystemTime::now()
        .checked_add(std::time::Duration::from_secs(3_600))
        .expect("cutoff in range");
    let deleted = store.delete_stale_ephemeral(future_cutoff).expect("prune");
    assert_eq!(deleted, 4);
    assert!(dir.path().join("creds.json").exists());
}

#[test]
fn persist_root_survives_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("fresh"));

    assert!(store.load_root().expect("load").is_none());

    let blob = serde_json::json!({"noise_key": "abc", "registration_id": 411});
    store.persist_root(&blob).expect("persist");
    let reloaded = store.load_root().expect("load").expect("blob present");
    assert_eq!(reloaded["registration_id"], 411);

    // No temp-file residue from the atomic replace.
    assert!(!store.root().join("creds.json.tmp").exists());
}

#[test]
fn persist_ephemeral_sanitizes_hostile_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path());

    store
        .persist_ephemeral("../../session-evil.json", &serde_json::json!({}))
        .expect("persist");

    // The traversal components are stripped, the file stays inside.
    assert!(store.root().join("....session-evil.json").exists());
    assert!(!dir.path().parent().expect("parent").join("session-evil.json").exists());
}
