//! Snapshot persistence tests

use tokio_test::{assert_err, assert_ok};

use rollout::deploy::executor::create_session;
use rollout::errors::EngineError;
use rollout::storage::snapshots::FORMAT_VERSION;

use crate::support::{new_session, step, store};

#[tokio::test]
async fn test_stray_temp_file_is_swept_on_save() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let mut snapshot = create_session(&store, new_session("stray", vec![step("a", "true", true, 1)]))
        .await
        .unwrap();

    // what a save interrupted before its rename leaves behind
    let session_dir = store.layout().session_dir("stray");
    let stray = session_dir.path().join(".snapshot.json.5f1d0c.tmp");
    std::fs::write(&stray, b"{\"format_version\": 1, \"check").unwrap();

    let loaded = store.load("stray").await.unwrap().unwrap();
    assert_eq!(loaded, snapshot);

    assert_ok!(store.save(&mut snapshot).await);
    assert!(!stray.exists());
    let remaining: Vec<_> = std::fs::read_dir(session_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(remaining, vec!["snapshot.json".to_string()]);
    assert_eq!(store.load("stray").await.unwrap().unwrap().sequence, 2);
}

#[tokio::test]
async fn test_truncated_snapshot_is_reported_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    create_session(&store, new_session("torn", vec![step("a", "true", true, 1)]))
        .await
        .unwrap();

    let path = store.layout().snapshot_file("torn").path().to_path_buf();
    let raw = std::fs::read(&path).unwrap();
    std::fs::write(&path, &raw[..raw.len() / 2]).unwrap();

    let err = assert_err!(store.load("torn").await);
    assert!(matches!(err, EngineError::CorruptSnapshot(ref id) if id == "torn"));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_newer_format_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    create_session(&store, new_session("future", vec![step("a", "true", true, 1)]))
        .await
        .unwrap();

    let file = store.layout().snapshot_file("future");
    let mut raw: serde_json::Value = file.read_json().await.unwrap();
    raw["format_version"] = serde_json::json!(FORMAT_VERSION + 1);
    file.write_json(&raw).await.unwrap();

    assert!(matches!(
        store.load("future").await,
        Err(EngineError::StorageError(_))
    ));
}

#[tokio::test]
async fn test_snapshot_survives_reload_with_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let snapshot = create_session(
        &store,
        new_session(
            "history",
            vec![step("a", "true", true, 2), step("b", "false", false, 1)],
        ),
    )
    .await
    .unwrap();

    let loaded = store.load("history").await.unwrap().unwrap();
    assert_eq!(loaded.session.step_ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(loaded.session.target.port, Some(2222));
    assert!(!loaded.steps[1].critical);
    assert_eq!(loaded, snapshot);
}

#[tokio::test]
async fn test_invalid_session_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let err = create_session(&store, new_session("../escape", vec![step("a", "true", true, 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationError(_)));
    assert!(store.list().await.unwrap().is_empty());
}
