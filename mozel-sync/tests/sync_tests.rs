use mozel_model::{EntitySchema, Mozel, PropertyDef, Registry};
use mozel_sync::{Commit, CommitBatch, MozelSync, SyncConfig, SyncError};
use mozel_types::{Gid, SyncId};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry() -> Registry {
    let registry = Registry::new();
    registry.define(
        EntitySchema::new("person")
            .with(PropertyDef::data("name"))
            .with(PropertyDef::entity("dog", "dog")),
    );
    registry.define(EntitySchema::new("dog").with(PropertyDef::data("name")));
    registry
}

struct Node {
    registry: Registry,
    sync: MozelSync,
}

impl Node {
    fn new(sync_id: &str, priority: i64) -> Self {
        Self::with_config(SyncConfig {
            sync_id: Some(SyncId::from(sync_id)),
            priority,
            ..Default::default()
        })
    }

    fn with_config(config: SyncConfig) -> Self {
        init_tracing();
        let registry = registry();
        let sync = MozelSync::new(config);
        sync.sync_registry(&registry).unwrap();
        sync.start();
        Self { registry, sync }
    }

    /// Creates the shared root entity every scenario starts from.
    fn root(&self) -> Mozel {
        self.registry
            .create("person", json!({ "gid": "p", "name": "init" }))
            .unwrap()
    }

    fn get(&self, gid: &str) -> Option<Mozel> {
        self.registry.get(&gid_of(gid))
    }
}

fn gid_of(s: &str) -> Gid {
    Gid::parse(s).unwrap()
}

// ── Registration ─────────────────────────────────────────────────

#[test]
fn sync_registry_backfills_and_follows_additions() {
    let registry = registry();
    let early = registry.create("person", json!({})).unwrap();
    let sync = MozelSync::new(SyncConfig::default());
    sync.sync_registry(&registry).unwrap();
    assert_eq!(sync.watched_gids(), vec![early.gid().clone()]);

    let late = registry.create("person", json!({})).unwrap();
    assert!(sync.watcher(late.gid()).is_some());
    assert_eq!(sync.watched_gids().len(), 2);
}

#[test]
fn second_registry_is_rejected() {
    let node = Node::new("a", 0);
    let other = registry();
    assert!(matches!(
        node.sync.sync_registry(&other),
        Err(SyncError::RegistryAlreadyAttached)
    ));
}

#[test]
fn register_is_idempotent() {
    let registry = registry();
    let m = registry.create("person", json!({})).unwrap();
    let sync = MozelSync::new(SyncConfig::default());
    sync.register(&m).unwrap();
    let watcher = sync.watcher(m.gid()).unwrap();
    sync.register(&m).unwrap();
    assert!(std::sync::Arc::ptr_eq(
        &watcher,
        &sync.watcher(m.gid()).unwrap()
    ));

    sync.unregister(&m);
    sync.unregister(&m);
    assert!(sync.watcher(m.gid()).is_none());
    assert!(watcher.is_destroyed());
}

#[test]
fn destroyed_entity_is_unregistered() {
    let node = Node::new("a", 0);
    let p = node.root();
    assert!(node.sync.watcher(p.gid()).is_some());
    p.destroy();
    assert!(node.sync.watcher(p.gid()).is_none());
}

#[test]
fn watchers_follow_start_and_stop() {
    let node = Node::new("a", 0);
    let p = node.root();
    let watcher = node.sync.watcher(p.gid()).unwrap();
    assert!(watcher.is_started());

    node.sync.stop();
    assert!(!node.sync.is_active());
    p.set("name", json!("ignored")).unwrap();
    assert!(!node.sync.has_changes());

    node.sync.start();
    p.set("name", json!("seen")).unwrap();
    assert!(node.sync.has_changes());
}

#[test]
fn destroy_forgets_everything() {
    let node = Node::new("a", 0);
    let p = node.root();
    node.sync.destroy();

    assert!(node.sync.is_destroyed());
    assert!(node.sync.watched_gids().is_empty());
    node.registry.create("person", json!({})).unwrap();
    assert!(node.sync.watched_gids().is_empty());
    assert!(matches!(node.sync.register(&p), Err(SyncError::Destroyed)));
}

// ── Commit ───────────────────────────────────────────────────────

#[test]
fn commit_contains_only_changed_entities() {
    let node = Node::new("a", 0);
    let p = node.root();
    node.registry
        .create("person", json!({ "gid": "q" }))
        .unwrap();
    p.set("name", json!("x")).unwrap();

    let batch = node.sync.commit();
    assert_eq!(batch.keys().cloned().collect::<Vec<_>>(), vec![gid_of("p")]);
    assert_eq!(batch[p.gid()].changes["name"], json!("x"));
    assert!(!node.sync.has_changes());
    assert!(node.sync.commit().is_empty());
}

#[test]
fn new_child_is_exported_in_full_once() {
    let node = Node::new("a", 0);
    let p = node.root();
    node.sync.commit();

    p.set("dog", json!({ "gid": "d1", "name": "Rex" })).unwrap();
    let first = node.sync.commit();
    assert_eq!(
        first[p.gid()].changes["dog"],
        json!({ "gid": "d1", "name": "Rex" })
    );

    let dog = node.get("d1").unwrap();
    p.set("dog", Value::Null).unwrap();
    p.set_entity("dog", Some(&dog)).unwrap();
    let second = node.sync.commit();
    assert_eq!(second[p.gid()].changes["dog"], json!({ "gid": "d1" }));
}

#[test]
fn subscribers_receive_committed_batches() {
    let node = Node::new("a", 0);
    let mut rx = node.sync.subscribe();
    let p = node.root();

    node.sync.commit();
    assert!(rx.try_recv().is_err());

    p.set("name", json!("x")).unwrap();
    let batch = node.sync.commit();
    assert_eq!(rx.try_recv().unwrap(), batch);
}

// ── Merge ────────────────────────────────────────────────────────

#[test]
fn two_peers_converge_on_higher_priority() {
    let a = Node::new("p1", 1);
    let b = Node::new("p2", 2);
    let pa = a.root();
    let pb = b.root();

    pa.set("name", json!("X")).unwrap();
    let from_a = a.sync.commit();
    pb.set("name", json!("Y")).unwrap();
    let from_b = b.sync.commit();

    a.sync.merge(from_b);
    b.sync.merge(from_a);

    assert_eq!(pa.get_value("name"), Some(json!("Y")));
    assert_eq!(pb.get_value("name"), Some(json!("Y")));
    assert!(!a.sync.has_changes());
    assert!(!b.sync.has_changes());
}

#[test]
fn retry_queue_resolves_child_created_in_same_batch() {
    let a = Node::new("a", 0);
    let b = Node::new("b", 0);
    let pa = a.root();
    b.root();

    // "a1" sorts before "p", so the child's own commit comes first.
    pa.set("dog", json!({ "gid": "a1", "name": "Rex" })).unwrap();
    a.get("a1").unwrap().set("name", json!("Max")).unwrap();
    let batch = a.sync.commit();
    assert_eq!(batch.len(), 2);

    let report = b.sync.merge(batch);
    assert!(report.unresolved.is_empty());
    assert_eq!(report.commits.len(), 2);

    let dog = b.get("a1").unwrap();
    assert_eq!(dog.get_value("name"), Some(json!("Max")));
    assert_eq!(dog.parent().map(|m| m.gid().clone()), Some(gid_of("p")));
    assert!(b.sync.watcher(dog.gid()).is_some());
}

#[test]
fn unknown_entities_are_reported_unresolved() {
    let b = Node::new("b", 0);
    b.root();
    let batch = CommitBatch::from([(
        gid_of("ghost"),
        Commit {
            sync_id: SyncId::from("a"),
            version: 1,
            priority: 0,
            base_version: 0,
            changes: [("name".to_string(), json!("boo"))].into(),
        },
    )]);

    let report = b.sync.merge(batch);
    assert_eq!(report.unresolved, vec![gid_of("ghost")]);
    assert!(report.commits.is_empty());
}

#[test]
fn relay_through_third_node_converges() {
    let a = Node::new("a", 1);
    let b = Node::new("b", 2);
    let server = Node::new("server", 0);
    let (pa, pb, ps) = (a.root(), b.root(), server.root());

    pa.set("name", json!("X")).unwrap();
    let from_a = a.sync.commit();
    pb.set("name", json!("Y")).unwrap();
    let from_b = b.sync.commit();

    let relay_a = server.sync.merge(from_a).relay();
    let relay_b = server.sync.merge(from_b).relay();
    b.sync.merge(relay_a);
    a.sync.merge(relay_b);

    for p in [&pa, &pb, &ps] {
        assert_eq!(p.get_value("name"), Some(json!("Y")));
    }
}

#[test]
fn relayed_duplicate_is_dropped_from_relay() {
    let a = Node::new("a", 0);
    let b = Node::new("b", 0);
    let pa = a.root();
    b.root();

    pa.set("name", json!("X")).unwrap();
    let batch = a.sync.commit();
    assert_eq!(b.sync.merge(batch.clone()).relay().len(), 1);
    assert!(b.sync.merge(batch).relay().is_empty());
}

#[test]
fn outdated_commit_is_reported_and_full_state_recovers() {
    let a = Node::with_config(SyncConfig {
        sync_id: Some(SyncId::from("a")),
        history_max_length: 2,
        ..Default::default()
    });
    let b = Node::new("b", 0);
    let pa = a.root();
    let pb = b.root();

    for i in 0..5 {
        pa.set("name", json!(i)).unwrap();
        a.sync.commit();
    }
    pb.set("name", json!("late")).unwrap();
    let report = a.sync.merge(b.sync.commit());
    let outdated = report.outdated[pa.gid()];
    assert_eq!((outdated.base_version, outdated.required_version), (0, 3));

    let resync = b.sync.apply_full_states(a.sync.create_full_states());
    assert!(resync.unresolved.is_empty());
    assert_eq!(pb.get_value("name"), Some(json!(4)));

    pb.set("name", json!("fresh")).unwrap();
    let report = a.sync.merge(b.sync.commit());
    assert!(report.outdated.is_empty());
    assert_eq!(pa.get_value("name"), Some(json!("fresh")));
}

#[test]
fn full_states_create_missing_children() {
    let a = Node::new("a", 0);
    let b = Node::new("b", 0);
    let pa = a.root();
    pa.set("dog", json!({ "gid": "d1", "name": "Rex" })).unwrap();
    b.root();

    let report = b.sync.apply_full_states(a.sync.create_full_states());
    assert!(report.unresolved.is_empty());
    assert_eq!(b.get("d1").unwrap().get_value("name"), Some(json!("Rex")));
    assert_eq!(b.get("p").unwrap().export_full(), pa.export_full());
}
