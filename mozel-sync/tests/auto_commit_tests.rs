use mozel_model::{EntitySchema, PropertyDef, Registry};
use mozel_sync::{MozelSync, SyncConfig};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const INTERVAL: Duration = Duration::from_millis(100);

fn setup() -> (Registry, MozelSync) {
    let registry = Registry::new();
    registry.define(
        EntitySchema::new("note")
            .with(PropertyDef::data("title"))
            .with(PropertyDef::data("body")),
    );
    let sync = MozelSync::new(SyncConfig {
        auto_commit: Some(INTERVAL),
        ..Default::default()
    });
    sync.sync_registry(&registry).unwrap();
    sync.start();
    (registry, sync)
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_is_committed_once() {
    let (registry, sync) = setup();
    let mut rx = sync.subscribe();
    let note = registry.create("note", json!({})).unwrap();

    note.set("title", json!("a")).unwrap();
    note.set("title", json!("b")).unwrap();
    note.set("body", json!("text")).unwrap();

    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    let commit = &batch[note.gid()];
    assert_eq!(commit.version, 1);
    assert_eq!(commit.changes["title"], json!("b"));
    assert_eq!(commit.changes["body"], json!("text"));

    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(next.is_err());
}

#[tokio::test(start_paused = true)]
async fn commit_waits_for_the_interval() {
    let (registry, sync) = setup();
    let mut rx = sync.subscribe();
    let note = registry.create("note", json!({})).unwrap();

    note.set("title", json!("a")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(sync.has_changes());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rx.try_recv().is_ok());
    assert!(!sync.has_changes());
}

#[tokio::test(start_paused = true)]
async fn later_changes_schedule_a_new_commit() {
    let (registry, sync) = setup();
    let mut rx = sync.subscribe();
    let note = registry.create("note", json!({})).unwrap();

    note.set("title", json!("a")).unwrap();
    let first = rx.recv().await.unwrap();
    note.set("title", json!("b")).unwrap();
    let second = rx.recv().await.unwrap();

    assert_eq!(first[note.gid()].version, 1);
    assert_eq!(second[note.gid()].version, 2);
    assert_eq!(second[note.gid()].base_version, 0);
}

#[test]
fn without_runtime_changes_stay_pending() {
    let (registry, sync) = setup();
    let note = registry.create("note", json!({})).unwrap();

    note.set("title", json!("a")).unwrap();

    assert!(sync.has_changes());
    let batch = sync.commit();
    assert_eq!(batch[note.gid()].changes["title"], json!("a"));
}
