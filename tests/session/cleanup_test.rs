//! Scheduled-cleanup safety behavior.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use waygate::session::cleanup::{observed_socket_state, run_cleanup, CleanupOutcome, SocketHandle};
use waygate::session::SessionStore;
use waygate::transport::ConnectionState;

fn seeded_store() -> (tempfile::TempDir, SessionStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("creds.json"), "{}").expect("write creds");
    fs::write(dir.path().join("session-5531.0.json"), "{}").expect("write session");
    fs::write(dir.path().join("pre-key-3.json"), "{}").expect("write pre-key");
    let store = SessionStore::new(dir.path());
    (dir, store)
}

#[test]
fn cleanup_skips_entirely_while_socket_is_open() {
    let (dir, store) = seeded_store();

    let outcome =
        run_cleanup(&store, ConnectionState::Open, Duration::ZERO).expect("cleanup run");

    assert_eq!(outcome, CleanupOutcome::SkippedLiveConnection);
    // Nothing was touched, stale or not.
    assert!(dir.path().join("session-5531.0.json").exists());
    assert!(dir.path().join("pre-key-3.json").exists());
}

#[test]
fn cleanup_prunes_stale_ephemeral_when_socket_closed() {
    let (dir, store) = seeded_store();

    // Let file mtimes fall strictly behind the zero-age cutoff.
    std::thread::sleep(Duration::from_millis(50));
    let outcome =
        run_cleanup(&store, ConnectionState::Close, Duration::ZERO).expect("cleanup run");

    assert_eq!(outcome, CleanupOutcome::Pruned { deleted: 2 });
    assert!(dir.path().join("creds.json").exists());
    assert!(!dir.path().join("session-5531.0.json").exists());
}

#[test]
fn cleanup_respects_safe_age() {
    let (dir, store) = seeded_store();

    // Everything was written moments ago; a 24h safe age spares it all.
    let outcome = run_cleanup(
        &store,
        ConnectionState::Close,
        Duration::from_secs(86_400),
    )
    .expect("cleanup run");

    assert_eq!(outcome, CleanupOutcome::Pruned { deleted: 0 });
    assert!(dir.path().join("session-5531.0.json").exists());
}

#[test]
fn cleanup_while_connecting_still_prunes() {
    // Only a live open connection blocks cleanup; a handshake in
    // progress reads its state fresh from disk afterwards.
    let (dir, store) = seeded_store();

    std::thread::sleep(Duration::from_millis(50));
    let outcome =
        run_cleanup(&store, ConnectionState::Connecting, Duration::ZERO).expect("cleanup run");

    assert_eq!(outcome, CleanupOutcome::Pruned { deleted: 2 });
    assert!(dir.path().join("creds.json").exists());
}

#[tokio::test]
async fn cleanup_prunes_when_no_socket_adapter_exists() {
    // A web-backed client never fills the socket handle; its session
    // files still age out.
    let (dir, store) = seeded_store();
    let socket: SocketHandle = Arc::new(Mutex::new(None));

    std::thread::sleep(Duration::from_millis(50));
    let state = observed_socket_state(&socket).await;
    let outcome = run_cleanup(&store, state, Duration::ZERO).expect("cleanup run");

    assert_eq!(outcome, CleanupOutcome::Pruned { deleted: 2 });
    assert!(dir.path().join("creds.json").exists());
}
