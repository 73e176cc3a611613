use mozel_model::{EntitySchema, Item, ModelError, Mozel, PropertyDef, Registry};
use mozel_types::Gid;
use pretty_assertions::assert_eq;
use serde_json::json;

fn registry() -> Registry {
    let registry = Registry::new();
    registry.define(
        EntitySchema::new("person")
            .with(PropertyDef::data("name"))
            .with(PropertyDef::entity("dog", "dog"))
            .with(PropertyDef::reference("friend", "person"))
            .with(PropertyDef::data_collection("tags")),
    );
    registry.define(
        EntitySchema::new("dog")
            .with(PropertyDef::data("name"))
            .with(PropertyDef::data("age"))
            .with(PropertyDef::entity_collection("toys", "toy")),
    );
    registry.define(EntitySchema::new("toy").with(PropertyDef::data("name")));
    registry
}

fn person(registry: &Registry, name: &str) -> Mozel {
    registry.create("person", json!({ "name": name })).unwrap()
}

// ── Creation & identity ──────────────────────────────────────────

#[test]
fn create_assigns_numeric_gid() {
    let registry = registry();
    let a = person(&registry, "Ann");
    let b = person(&registry, "Bob");
    assert_eq!(a.gid(), &Gid::from_number(1));
    assert_eq!(b.gid(), &Gid::from_number(2));
    assert_eq!(a.entity_type(), "person");
}

#[test]
fn create_with_explicit_gid() {
    let registry = registry();
    let m = registry
        .create("person", json!({ "gid": "ann", "name": "Ann" }))
        .unwrap();
    assert_eq!(m.gid().as_str(), "ann");
    assert_eq!(m.get_value("name"), Some(json!("Ann")));
}

#[test]
fn nested_children_get_distinct_gids() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "name": "Ann", "dog": { "name": "Rex" } }))
        .unwrap();
    let dog = p.get("dog").and_then(|n| n.as_entity().cloned()).unwrap();
    assert_ne!(dog.gid(), p.gid());
    assert_eq!(dog.parent(), Some(p.clone()));
}

#[test]
fn unknown_entity_type_is_rejected() {
    let registry = registry();
    let err = registry.create("cat", json!({})).unwrap_err();
    assert!(matches!(err, ModelError::UnknownEntityType(t) if t == "cat"));
}

// ── Reading ──────────────────────────────────────────────────────

#[test]
fn get_navigates_nested_paths() {
    let registry = registry();
    let p = registry
        .create(
            "person",
            json!({
                "name": "Ann",
                "dog": { "name": "Rex", "toys": [{ "name": "ball" }] }
            }),
        )
        .unwrap();
    assert_eq!(p.get_value("dog.name"), Some(json!("Rex")));
    assert_eq!(p.get_value("dog.toys.0.name"), Some(json!("ball")));
    assert!(p.get("dog.toys.5").is_none());
    assert!(p.get("nope").is_none());
}

#[test]
fn get_navigates_into_data_values() {
    let registry = registry();
    let p = person(&registry, "Ann");
    p.set("tags", json!(["a", "b"])).unwrap();
    assert_eq!(p.get_value("tags.1"), Some(json!("b")));
}

// ── Export ───────────────────────────────────────────────────────

#[test]
fn export_full_includes_children() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "gid": 1, "name": "Ann", "dog": { "gid": 2, "name": "Rex" } }))
        .unwrap();
    assert_eq!(
        p.export_full(),
        json!({
            "gid": "1",
            "name": "Ann",
            "dog": { "gid": "2", "name": "Rex", "age": null, "toys": [] },
            "friend": null,
            "tags": []
        })
    );
}

#[test]
fn export_shallow_uses_gid_refs() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "gid": 1, "name": "Ann", "dog": { "gid": 2 } }))
        .unwrap();
    assert_eq!(p.export_shallow()["dog"], json!({ "gid": "2" }));
}

#[test]
fn export_with_expands_selected_children() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "name": "Ann", "dog": { "gid": "rex", "name": "Rex" } }))
        .unwrap();
    let rex = Gid::parse("rex").unwrap();
    let value = p.export_property_with("dog", &|gid| gid == &rex).unwrap();
    assert_eq!(value["name"], json!("Rex"));
    let value = p.export_property_with("dog", &|_| false).unwrap();
    assert_eq!(value, json!({ "gid": "rex" }));
}

// ── set_data ─────────────────────────────────────────────────────

#[test]
fn set_data_merge_keeps_missing_properties() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "name": "Ann", "tags": ["x"] }))
        .unwrap();
    p.set_data(&json!({ "name": "Anna" }), true).unwrap();
    assert_eq!(p.get_value("name"), Some(json!("Anna")));
    assert_eq!(p.get_value("tags"), Some(json!(["x"])));
}

#[test]
fn set_data_replace_resets_missing_properties() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "name": "Ann", "tags": ["x"] }))
        .unwrap();
    p.set_data(&json!({ "name": "Anna" }), false).unwrap();
    assert_eq!(p.get_value("tags"), Some(json!([])));
}

#[test]
fn set_data_reuses_existing_entity_by_gid() {
    let registry = registry();
    let dog = registry
        .create("dog", json!({ "gid": "rex", "name": "Rex" }))
        .unwrap();
    let p = person(&registry, "Ann");
    p.set_data(&json!({ "dog": { "gid": "rex", "age": 3 } }), true)
        .unwrap();
    let held = p.get("dog").and_then(|n| n.as_entity().cloned()).unwrap();
    assert_eq!(held, dog);
    assert_eq!(dog.get_value("age"), Some(json!(3)));
    assert_eq!(dog.get_value("name"), Some(json!("Rex")));
}

#[test]
fn set_data_rejects_unknown_property() {
    let registry = registry();
    let p = person(&registry, "Ann");
    let err = p.set_data(&json!({ "color": "red" }), true).unwrap_err();
    assert!(matches!(err, ModelError::UnknownProperty { property, .. } if property == "color"));
}

#[test]
fn set_data_rejects_non_object() {
    let registry = registry();
    let p = person(&registry, "Ann");
    assert!(matches!(
        p.set_data(&json!([1, 2]), true),
        Err(ModelError::TypeMismatch { .. })
    ));
}

#[test]
fn entity_property_rejects_scalar() {
    let registry = registry();
    let p = person(&registry, "Ann");
    assert!(matches!(
        p.set("dog", json!(5)),
        Err(ModelError::TypeMismatch { .. })
    ));
}

#[test]
fn rejected_set_data_applies_nothing() {
    let registry = registry();
    let p = person(&registry, "Ann");
    let before = registry.len();

    // `name` comes first in the schema; the bad toy deep inside `dog` must
    // still stop it from being assigned.
    let err = p
        .set_data(
            &json!({ "name": "Bob", "dog": { "name": "Rex", "toys": [{ "name": "ball", "colour": 1 }] } }),
            true,
        )
        .unwrap_err();

    assert!(matches!(err, ModelError::UnknownProperty { property, .. } if property == "colour"));
    assert_eq!(p.get_value("name"), Some(json!("Ann")));
    assert_eq!(p.get_value("dog"), Some(serde_json::Value::Null));
    assert_eq!(registry.len(), before);
}

// ── References ───────────────────────────────────────────────────

#[test]
fn reference_resolves_lazily() {
    let registry = registry();
    let ann = person(&registry, "Ann");
    ann.set("friend", json!({ "gid": "bob" })).unwrap();
    assert!(ann.get("friend").unwrap().as_entity().is_none());

    let bob = registry
        .create("person", json!({ "gid": "bob", "name": "Bob" }))
        .unwrap();
    assert_eq!(ann.get("friend").unwrap().as_entity(), Some(&bob));
    assert_eq!(ann.get_value("friend.name"), Some(json!("Bob")));
    // references never take ownership
    assert_eq!(bob.parent(), None);
}

#[test]
fn set_entity_on_reference_stores_gid() {
    let registry = registry();
    let ann = person(&registry, "Ann");
    let bob = person(&registry, "Bob");
    ann.set_entity("friend", Some(&bob)).unwrap();
    assert_eq!(ann.export_full()["friend"], json!({ "gid": bob.gid().as_str() }));
}

// ── Ownership ────────────────────────────────────────────────────

#[test]
fn replacing_child_detaches_old_one() {
    let registry = registry();
    let p = person(&registry, "Ann");
    p.set("dog", json!({ "name": "Rex" })).unwrap();
    let rex = p.get("dog").and_then(|n| n.as_entity().cloned()).unwrap();
    p.set("dog", json!({ "name": "Fido" })).unwrap();
    assert_eq!(rex.parent(), None);
}

#[test]
fn ownership_cycle_is_rejected() {
    let registry = registry();
    let p = registry
        .create("person", json!({ "name": "Ann" }))
        .unwrap();
    let dog = registry.create("dog", json!({ "name": "Rex" })).unwrap();
    p.set_entity("dog", Some(&dog)).unwrap();
    let err = p.set_entity("dog", Some(&p)).unwrap_err();
    assert!(matches!(err, ModelError::OwnershipCycle(_)));
}

// ── Collections ──────────────────────────────────────────────────

#[test]
fn push_and_remove_entities() {
    let registry = registry();
    let dog = registry.create("dog", json!({ "name": "Rex" })).unwrap();
    dog.push("toys", json!({ "name": "ball" })).unwrap();
    dog.push("toys", json!({ "name": "bone" })).unwrap();
    let toys = dog.collection("toys").unwrap();
    assert_eq!(toys.len(), 2);
    let ball = toys[0].as_entity().cloned().unwrap();
    assert_eq!(ball.parent(), Some(dog.clone()));

    let removed = dog.remove_at("toys", 0).unwrap();
    assert!(matches!(removed, Item::Entity(ref m) if m == &ball));
    assert_eq!(ball.parent(), None);
    assert_eq!(dog.get_value("toys.0.name"), Some(json!("bone")));
}

#[test]
fn remove_out_of_range() {
    let registry = registry();
    let dog = registry.create("dog", json!({})).unwrap();
    let err = dog.remove_at("toys", 0).unwrap_err();
    assert!(matches!(err, ModelError::IndexOutOfRange { index: 0, len: 0, .. }));
}

#[test]
fn push_on_non_collection_fails() {
    let registry = registry();
    let dog = registry.create("dog", json!({})).unwrap();
    assert!(matches!(
        dog.push("name", json!("x")),
        Err(ModelError::TypeMismatch { .. })
    ));
}

// ── Destroy ──────────────────────────────────────────────────────

#[test]
fn destroyed_entity_rejects_mutation() {
    let registry = registry();
    let p = person(&registry, "Ann");
    p.destroy();
    assert!(p.is_destroyed());
    assert!(matches!(
        p.set("name", json!("x")),
        Err(ModelError::Destroyed(_))
    ));
}

#[test]
fn destroy_fires_listeners_once() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let registry = registry();
    let p = person(&registry, "Ann");
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    p.on_destroyed(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    p.destroy();
    p.destroy();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!registry.contains(p.gid()));
}
