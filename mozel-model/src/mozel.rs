//! The entity handle.
//!
//! A [`Mozel`] is a cheap, cloneable handle to one node of the entity tree.
//! Owned children keep a weak link to their parent so changes bubble up as
//! prefixed paths (`dog.toys.0.name`); the registry is also held weakly.
//!
//! Locks are never held while user handlers run or while another entity is
//! mutated, so handlers may freely read (or mutate) the tree.

use crate::collection_diff;
use crate::error::{ModelError, ModelResult};
use crate::path::{self, PathPattern};
use crate::registry::{ListenerId, Registry, RegistryInner};
use crate::schema::{EntitySchema, ItemKind, PropertyDef, PropertyKind};
use crate::watcher::{self, PathChange, PathChangeWatcher, WatchId, WatchOptions};
use indexmap::IndexMap;
use mozel_types::Gid;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Callback invoked when an entity is destroyed.
pub type DestroyListener = Arc<dyn Fn(&Mozel) + Send + Sync>;

/// The reference form of an entity: `{"gid": ..}`.
pub fn gid_ref(gid: &Gid) -> Value {
    json!({ "gid": gid.as_str() })
}

/// Reads a gid out of an exported value (`{"gid": ..}`, a string or a number).
pub fn gid_of(value: &Value) -> ModelResult<Gid> {
    let raw = match value {
        Value::Object(obj) => obj.get("gid").unwrap_or(&Value::Null),
        other => other,
    };
    serde_json::from_value(raw.clone()).map_err(|_| ModelError::InvalidGid(raw.to_string()))
}

/// Checks a data object against `schema` before anything is assigned, so a
/// rejected update leaves the tree as it was. Nested entity objects are
/// checked against their own type's schema.
pub(crate) fn validate_data(
    registry: Option<&Registry>,
    schema: &EntitySchema,
    data: &Value,
) -> ModelResult<()> {
    let obj = data.as_object().ok_or_else(|| ModelError::TypeMismatch {
        property: schema.entity_type.clone(),
        expected: "object",
    })?;
    for (key, value) in obj {
        if key == "gid" {
            continue;
        }
        let def = schema
            .property(key)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity_type: schema.entity_type.clone(),
                property: key.clone(),
            })?;
        validate_property(registry, def, value)?;
    }
    Ok(())
}

fn validate_property(
    registry: Option<&Registry>,
    def: &PropertyDef,
    value: &Value,
) -> ModelResult<()> {
    match &def.kind {
        PropertyKind::Data => Ok(()),
        PropertyKind::Entity { .. } if def.reference => match value {
            Value::Null => Ok(()),
            other => gid_of(other).map(drop),
        },
        PropertyKind::Entity { entity_type } => match value {
            Value::Null => Ok(()),
            Value::Object(_) => validate_entity(registry, entity_type, value),
            _ => Err(ModelError::TypeMismatch {
                property: def.name.clone(),
                expected: "entity object or null",
            }),
        },
        PropertyKind::Collection { item } => {
            let values = value.as_array().ok_or_else(|| ModelError::TypeMismatch {
                property: def.name.clone(),
                expected: "array",
            })?;
            values
                .iter()
                .try_for_each(|v| validate_item(registry, item, v, &def.name))
        }
    }
}

fn validate_item(
    registry: Option<&Registry>,
    kind: &ItemKind,
    value: &Value,
    property: &str,
) -> ModelResult<()> {
    match kind {
        ItemKind::Data => Ok(()),
        ItemKind::Entity { entity_type } if value.is_object() => {
            validate_entity(registry, entity_type, value)
        }
        ItemKind::Entity { .. } => Err(ModelError::TypeMismatch {
            property: property.to_string(),
            expected: "entity object",
        }),
    }
}

fn validate_entity(
    registry: Option<&Registry>,
    entity_type: &str,
    value: &Value,
) -> ModelResult<()> {
    let registry = registry.ok_or(ModelError::RegistryDropped)?;
    if value.get("gid").is_some() {
        gid_of(value)?;
    }
    let schema = registry
        .schema(entity_type)
        .ok_or_else(|| ModelError::UnknownEntityType(entity_type.to_string()))?;
    validate_data(Some(registry), &schema, value)
}

/// An item of a collection.
#[derive(Debug, Clone)]
pub enum Item {
    Data(Value),
    Entity(Mozel),
}

impl Item {
    pub fn as_entity(&self) -> Option<&Mozel> {
        match self {
            Self::Entity(m) => Some(m),
            Self::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Entity(_) => None,
        }
    }

    fn export_with(&self, expand: &dyn Fn(&Gid) -> bool) -> Value {
        match self {
            Self::Data(v) => v.clone(),
            Self::Entity(m) if expand(m.gid()) => m.export_with(expand),
            Self::Entity(m) => gid_ref(m.gid()),
        }
    }

    fn key(&self) -> ItemKey {
        match self {
            Self::Data(v) => ItemKey::Data(v.to_string()),
            Self::Entity(m) => ItemKey::Entity(m.gid().clone()),
        }
    }

    fn into_node(self) -> Node {
        match self {
            Self::Data(v) => Node::Data(v),
            Self::Entity(m) => Node::Entity(m),
        }
    }
}

/// Identity of a collection item for diffing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ItemKey {
    Data(String),
    Entity(Gid),
}

#[derive(Debug, Clone)]
enum Slot {
    Data(Value),
    Entity(Option<Mozel>),
    Reference(Option<Gid>),
    Collection(Vec<Item>),
}

impl Slot {
    fn default_for(def: &PropertyDef) -> Self {
        match &def.kind {
            PropertyKind::Data => Self::Data(Value::Null),
            PropertyKind::Entity { .. } if def.reference => Self::Reference(None),
            PropertyKind::Entity { .. } => Self::Entity(None),
            PropertyKind::Collection { .. } => Self::Collection(Vec::new()),
        }
    }

    fn owned(&self) -> Vec<Mozel> {
        match self {
            Self::Entity(Some(m)) => vec![m.clone()],
            Self::Collection(items) => items.iter().filter_map(Item::as_entity).cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn export_with(&self, expand: &dyn Fn(&Gid) -> bool) -> Value {
        match self {
            Self::Data(v) => v.clone(),
            Self::Entity(None) | Self::Reference(None) => Value::Null,
            Self::Entity(Some(m)) if expand(m.gid()) => m.export_with(expand),
            Self::Entity(Some(m)) => gid_ref(m.gid()),
            Self::Reference(Some(gid)) => gid_ref(gid),
            Self::Collection(items) => {
                Value::Array(items.iter().map(|i| i.export_with(expand)).collect())
            }
        }
    }
}

/// A value read from the tree at some path.
#[derive(Debug, Clone)]
pub enum Node {
    Data(Value),
    Entity(Mozel),
    /// A reference property; `target` is the registry lookup at read time.
    Reference { gid: Gid, target: Option<Mozel> },
    Collection(Vec<Item>),
}

impl Node {
    /// Navigates one segment down.
    pub fn child(&self, key: &str) -> Option<Node> {
        match self {
            Self::Data(Value::Object(obj)) => obj.get(key).cloned().map(Node::Data),
            Self::Data(Value::Array(arr)) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| arr.get(i))
                .cloned()
                .map(Node::Data),
            Self::Data(_) => None,
            Self::Entity(m) => m.property_node(key),
            Self::Reference { target, .. } => target.as_ref()?.property_node(key),
            Self::Collection(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .map(Item::into_node),
        }
    }

    /// Keys a wildcard segment expands to.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Data(Value::Object(obj)) => obj.keys().cloned().collect(),
            Self::Data(Value::Array(arr)) => (0..arr.len()).map(|i| i.to_string()).collect(),
            Self::Data(_) => Vec::new(),
            Self::Entity(m) => m.property_names(),
            Self::Reference { target, .. } => {
                target.as_ref().map(Mozel::property_names).unwrap_or_default()
            }
            Self::Collection(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        }
    }

    /// Exports the node. Shallow exports represent entities by identity
    /// (`{"gid": ..}`); deep exports copy owned entities structurally.
    /// References are always exported by identity.
    pub fn export(&self, deep: bool) -> Value {
        let expand = |_: &Gid| deep;
        match self {
            Self::Data(v) => v.clone(),
            Self::Entity(m) if deep => m.export_full(),
            Self::Entity(m) => gid_ref(m.gid()),
            Self::Reference { gid, .. } => gid_ref(gid),
            Self::Collection(items) => {
                Value::Array(items.iter().map(|i| i.export_with(&expand)).collect())
            }
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Mozel> {
        match self {
            Self::Entity(m) => Some(m),
            Self::Reference { target, .. } => target.as_ref(),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct ParentLink {
    mozel: Weak<MozelInner>,
    property: String,
}

struct MozelState {
    parent: Option<ParentLink>,
    slots: IndexMap<String, Slot>,
    destroyed: bool,
}

pub(crate) struct MozelInner {
    gid: Gid,
    schema: Arc<EntitySchema>,
    registry: Weak<RegistryInner>,
    state: RwLock<MozelState>,
    watchers: RwLock<Vec<(WatchId, Arc<PathChangeWatcher>)>>,
    destroy_listeners: RwLock<Vec<(ListenerId, DestroyListener)>>,
    next_id: AtomicU64,
}

/// Handle to one entity of the tree.
#[derive(Clone)]
pub struct Mozel {
    inner: Arc<MozelInner>,
}

impl Mozel {
    pub(crate) fn new(gid: Gid, schema: Arc<EntitySchema>, registry: Weak<RegistryInner>) -> Self {
        let slots = schema
            .properties
            .iter()
            .map(|def| (def.name.clone(), Slot::default_for(def)))
            .collect();
        Self {
            inner: Arc::new(MozelInner {
                gid,
                schema,
                registry,
                state: RwLock::new(MozelState {
                    parent: None,
                    slots,
                    destroyed: false,
                }),
                watchers: RwLock::new(Vec::new()),
                destroy_listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn gid(&self) -> &Gid {
        &self.inner.gid
    }

    pub fn entity_type(&self) -> &str {
        &self.inner.schema.entity_type
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.inner.schema
    }

    /// The registry this entity belongs to, if it still exists.
    pub fn registry(&self) -> Option<Registry> {
        self.inner.registry.upgrade().map(Registry::from_inner)
    }

    /// The owning parent, if any.
    pub fn parent(&self) -> Option<Mozel> {
        let link = self.inner.state.read().parent.clone()?;
        link.mozel.upgrade().map(|inner| Mozel { inner })
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.read().destroyed
    }

    pub fn property_names(&self) -> Vec<String> {
        self.inner.state.read().slots.keys().cloned().collect()
    }

    fn property_def(&self, name: &str) -> ModelResult<&PropertyDef> {
        self.inner
            .schema
            .property(name)
            .ok_or_else(|| ModelError::UnknownProperty {
                entity_type: self.inner.schema.entity_type.clone(),
                property: name.to_string(),
            })
    }

    fn ensure_alive(&self) -> ModelResult<()> {
        if self.is_destroyed() {
            return Err(ModelError::Destroyed(self.gid().clone()));
        }
        Ok(())
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Reads the node at a dot-separated path (`""` is the entity itself).
    pub fn get(&self, path: &str) -> Option<Node> {
        self.get_segments(&path::split(path))
    }

    /// Reads the node at a pre-split path.
    pub fn get_segments(&self, segments: &[String]) -> Option<Node> {
        let mut node = Node::Entity(self.clone());
        for segment in segments {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Reads a path and exports it shallowly.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        self.get(path).map(|node| node.export(false))
    }

    /// Reads one property.
    pub fn get_property(&self, name: &str) -> Option<Node> {
        self.property_node(name)
    }

    fn property_node(&self, name: &str) -> Option<Node> {
        let slot = self.inner.state.read().slots.get(name).cloned()?;
        Some(match slot {
            Slot::Data(v) => Node::Data(v),
            Slot::Entity(Some(m)) => Node::Entity(m),
            Slot::Entity(None) | Slot::Reference(None) => Node::Data(Value::Null),
            Slot::Reference(Some(gid)) => {
                let target = self.registry().and_then(|r| r.get(&gid));
                Node::Reference { gid, target }
            }
            Slot::Collection(items) => Node::Collection(items),
        })
    }

    /// Returns the items of a collection property.
    pub fn collection(&self, name: &str) -> ModelResult<Vec<Item>> {
        match self.inner.state.read().slots.get(name) {
            Some(Slot::Collection(items)) => Ok(items.clone()),
            Some(_) => Err(ModelError::TypeMismatch {
                property: name.to_string(),
                expected: "collection",
            }),
            None => Err(ModelError::UnknownProperty {
                entity_type: self.inner.schema.entity_type.clone(),
                property: name.to_string(),
            }),
        }
    }

    // ── Export ───────────────────────────────────────────────────

    /// Exports the whole subtree, owned children included.
    pub fn export_full(&self) -> Value {
        self.export_with(&|_| true)
    }

    /// Exports this entity with children represented by `{"gid": ..}`.
    pub fn export_shallow(&self) -> Value {
        self.export_with(&|_| false)
    }

    /// Exports this entity; owned children for which `expand` returns true
    /// are exported in full (recursively), the rest by identity.
    pub fn export_with(&self, expand: &dyn Fn(&Gid) -> bool) -> Value {
        let slots: Vec<(String, Slot)> = self
            .inner
            .state
            .read()
            .slots
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = Map::new();
        out.insert("gid".into(), Value::String(self.gid().to_string()));
        for (name, slot) in slots {
            out.insert(name, slot.export_with(expand));
        }
        Value::Object(out)
    }

    /// Exports one property with the same rule as [`Mozel::export_with`].
    pub fn export_property_with(&self, name: &str, expand: &dyn Fn(&Gid) -> bool) -> Option<Value> {
        let slot = self.inner.state.read().slots.get(name).cloned()?;
        Some(slot.export_with(expand))
    }

    // ── Mutation ─────────────────────────────────────────────────

    /// Sets one property from its JSON form.
    pub fn set(&self, name: &str, value: Value) -> ModelResult<()> {
        let def = self.property_def(name)?;
        validate_property(self.registry().as_ref(), def, &value)?;
        watcher::tick(|| self.assign(name, &value, true))
    }

    /// Sets an entity property to an existing entity (or clears it).
    pub fn set_entity(&self, name: &str, child: Option<&Mozel>) -> ModelResult<()> {
        let def = self.property_def(name)?;
        if !matches!(def.kind, PropertyKind::Entity { .. }) {
            return Err(ModelError::TypeMismatch {
                property: name.to_string(),
                expected: "entity",
            });
        }
        let slot = if def.reference {
            Slot::Reference(child.map(|c| c.gid().clone()))
        } else {
            Slot::Entity(child.cloned())
        };
        watcher::tick(|| self.replace_slot(name, slot))
    }

    /// Applies a partial (`merge = true`) or complete (`merge = false`) data
    /// object. With `merge = false`, properties missing from `data` are reset
    /// to their defaults. The `gid` key is identity and is ignored.
    ///
    /// A value that does not fit the schema is rejected before anything is
    /// applied.
    pub fn set_data(&self, data: &Value, merge: bool) -> ModelResult<()> {
        validate_data(self.registry().as_ref(), &self.inner.schema, data)?;
        watcher::tick(|| self.apply_data(data, merge))
    }

    /// Appends an item to a collection property.
    pub fn push(&self, name: &str, value: Value) -> ModelResult<()> {
        let item_kind = self.item_kind(name)?;
        validate_item(self.registry().as_ref(), &item_kind, &value, name)?;
        watcher::tick(|| {
            let item = self.resolve_item(&item_kind, &value, true, name)?;
            let mut items = self.collection(name)?;
            items.push(item);
            self.replace_slot(name, Slot::Collection(items))
        })
    }

    /// Removes and returns the item at `index` of a collection property.
    pub fn remove_at(&self, name: &str, index: usize) -> ModelResult<Item> {
        watcher::tick(|| {
            let mut items = self.collection(name)?;
            if index >= items.len() {
                return Err(ModelError::IndexOutOfRange {
                    property: name.to_string(),
                    index,
                    len: items.len(),
                });
            }
            let removed = items.remove(index);
            self.replace_slot(name, Slot::Collection(items))?;
            Ok(removed)
        })
    }

    fn item_kind(&self, name: &str) -> ModelResult<ItemKind> {
        match &self.property_def(name)?.kind {
            PropertyKind::Collection { item } => Ok(item.clone()),
            _ => Err(ModelError::TypeMismatch {
                property: name.to_string(),
                expected: "collection",
            }),
        }
    }

    pub(crate) fn apply_data(&self, data: &Value, merge: bool) -> ModelResult<()> {
        self.ensure_alive()?;
        let obj = data.as_object().ok_or_else(|| ModelError::TypeMismatch {
            property: self.gid().to_string(),
            expected: "object",
        })?;
        if let Some(unknown) = obj
            .keys()
            .find(|k| k.as_str() != "gid" && self.inner.schema.property(k).is_none())
        {
            return Err(ModelError::UnknownProperty {
                entity_type: self.inner.schema.entity_type.clone(),
                property: unknown.clone(),
            });
        }
        let schema = self.inner.schema.clone();
        for def in &schema.properties {
            match obj.get(&def.name) {
                Some(value) => self.assign(&def.name, value, merge)?,
                None if !merge => self.replace_slot(&def.name, Slot::default_for(def))?,
                None => {}
            }
        }
        Ok(())
    }

    fn assign(&self, name: &str, value: &Value, merge: bool) -> ModelResult<()> {
        let def = self.property_def(name)?.clone();
        let slot = self.resolve_slot(&def, value, merge)?;
        self.replace_slot(name, slot)
    }

    fn resolve_slot(&self, def: &PropertyDef, value: &Value, merge: bool) -> ModelResult<Slot> {
        match &def.kind {
            PropertyKind::Data => Ok(Slot::Data(value.clone())),
            PropertyKind::Entity { .. } if def.reference => match value {
                Value::Null => Ok(Slot::Reference(None)),
                other => Ok(Slot::Reference(Some(gid_of(other)?))),
            },
            PropertyKind::Entity { entity_type } => Ok(Slot::Entity(self.resolve_entity(
                entity_type,
                value,
                merge,
                &def.name,
            )?)),
            PropertyKind::Collection { item } => {
                let values = value.as_array().ok_or_else(|| ModelError::TypeMismatch {
                    property: def.name.clone(),
                    expected: "array",
                })?;
                let items = values
                    .iter()
                    .map(|v| self.resolve_item(item, v, merge, &def.name))
                    .collect::<ModelResult<Vec<_>>>()?;
                Ok(Slot::Collection(items))
            }
        }
    }

    fn resolve_item(
        &self,
        kind: &ItemKind,
        value: &Value,
        merge: bool,
        property: &str,
    ) -> ModelResult<Item> {
        match kind {
            ItemKind::Data => Ok(Item::Data(value.clone())),
            ItemKind::Entity { entity_type } => self
                .resolve_entity(entity_type, value, merge, property)?
                .map(Item::Entity)
                .ok_or_else(|| ModelError::TypeMismatch {
                    property: property.to_string(),
                    expected: "entity object",
                }),
        }
    }

    /// Turns the JSON form of a child into an entity: an existing gid is
    /// looked up (and updated when more than the gid is given), anything else
    /// is created through the registry.
    fn resolve_entity(
        &self,
        entity_type: &str,
        value: &Value,
        merge: bool,
        property: &str,
    ) -> ModelResult<Option<Mozel>> {
        let obj = match value {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            _ => {
                return Err(ModelError::TypeMismatch {
                    property: property.to_string(),
                    expected: "entity object or null",
                });
            }
        };
        let registry = self.registry().ok_or(ModelError::RegistryDropped)?;
        if obj.contains_key("gid") {
            let gid = gid_of(value)?;
            if let Some(existing) = registry.get(&gid) {
                if obj.len() > 1 {
                    existing.apply_data(value, merge)?;
                }
                return Ok(Some(existing));
            }
        }
        registry.create(entity_type, value.clone()).map(Some)
    }

    fn has_ancestor(&self, candidate: &Mozel) -> bool {
        let mut current = self.parent();
        while let Some(parent) = current {
            if &parent == candidate {
                return true;
            }
            current = parent.parent();
        }
        false
    }

    fn replace_slot(&self, name: &str, slot: Slot) -> ModelResult<()> {
        self.ensure_alive()?;
        self.property_def(name)?;
        for child in slot.owned() {
            if &child == self || self.has_ancestor(&child) {
                return Err(ModelError::OwnershipCycle(child.gid().clone()));
            }
        }

        let path = vec![name.to_string()];
        self.notify_before(&path);
        let old = {
            let mut state = self.inner.state.write();
            match state.slots.get_mut(name) {
                Some(current) => std::mem::replace(current, slot.clone()),
                None => Slot::Data(Value::Null),
            }
        };
        self.relink(name, &old, &slot);
        self.notify_after(&path);
        Ok(())
    }

    /// Updates parent links of owned children after a slot changed.
    fn relink(&self, name: &str, old: &Slot, new: &Slot) {
        match (old, new) {
            (Slot::Collection(before), Slot::Collection(after)) => {
                let before_keys: Vec<ItemKey> = before.iter().map(Item::key).collect();
                let after_keys: Vec<ItemKey> = after.iter().map(Item::key).collect();
                let mutations = collection_diff::diff(&before_keys, &after_keys);
                for removed in &mutations.removed {
                    if let Some(Item::Entity(child)) = before.get(removed.index) {
                        child.detach_from(self, name);
                    }
                }
                for added in &mutations.added {
                    if let Some(Item::Entity(child)) = after.get(added.index) {
                        child.attach_to(self, name);
                    }
                }
            }
            _ => {
                let keep = new.owned();
                for child in old.owned() {
                    if !keep.contains(&child) {
                        child.detach_from(self, name);
                    }
                }
                for child in keep {
                    child.attach_to(self, name);
                }
            }
        }
    }

    fn attach_to(&self, parent: &Mozel, property: &str) {
        self.inner.state.write().parent = Some(ParentLink {
            mozel: Arc::downgrade(&parent.inner),
            property: property.to_string(),
        });
    }

    fn detach_from(&self, parent: &Mozel, property: &str) {
        let mut state = self.inner.state.write();
        let owned_here = state.parent.as_ref().is_some_and(|link| {
            link.property == property && Weak::ptr_eq(&link.mozel, &Arc::downgrade(&parent.inner))
        });
        if owned_here {
            state.parent = None;
        }
    }

    // ── Change notification ──────────────────────────────────────

    /// The path of this entity relative to its parent: the property name,
    /// plus the index when it sits in a collection.
    fn parent_path(&self) -> Option<(Mozel, Vec<String>)> {
        let link = self.inner.state.read().parent.clone()?;
        let parent = Mozel {
            inner: link.mozel.upgrade()?,
        };
        let mut prefix = vec![link.property.clone()];
        if let Ok(items) = parent.collection(&link.property) {
            let index = items.iter().position(|i| i.as_entity() == Some(self))?;
            prefix.push(index.to_string());
        }
        Some((parent, prefix))
    }

    fn matching_watchers(&self, changed: &[String]) -> Vec<Arc<PathChangeWatcher>> {
        self.inner
            .watchers
            .read()
            .iter()
            .filter(|(_, w)| w.matches(changed))
            .map(|(_, w)| w.clone())
            .collect()
    }

    fn notify_before(&self, changed: &[String]) {
        for w in self.matching_watchers(changed) {
            w.before_change(self, changed);
        }
        if let Some((parent, mut prefix)) = self.parent_path() {
            prefix.extend_from_slice(changed);
            parent.notify_before(&prefix);
        }
    }

    fn notify_after(&self, changed: &[String]) {
        for w in self.matching_watchers(changed) {
            w.after_change(self, changed);
        }
        if let Some((parent, mut prefix)) = self.parent_path() {
            prefix.extend_from_slice(changed);
            parent.notify_after(&prefix);
        }
    }

    // ── Watching ─────────────────────────────────────────────────

    /// Watches a path pattern on this entity and its descendants.
    pub fn watch(
        &self,
        pattern: &str,
        options: WatchOptions,
        handler: impl Fn(&PathChange) + Send + Sync + 'static,
    ) -> ModelResult<WatchId> {
        let pattern = PathPattern::parse(pattern)?;
        let watcher = Arc::new(PathChangeWatcher::new(pattern, options, Arc::new(handler)));
        let id = WatchId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.watchers.write().push((id, watcher.clone()));
        if options.immediate {
            watcher.fire_immediate(self);
        }
        Ok(id)
    }

    /// Removes a watcher. Returns false if it was not registered.
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watchers = self.inner.watchers.write();
        let before = watchers.len();
        watchers.retain(|(wid, _)| *wid != id);
        watchers.len() != before
    }

    /// Number of active watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.read().len()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Registers a listener for the destroyed signal.
    pub fn on_destroyed(&self, listener: impl Fn(&Mozel) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .destroy_listeners
            .write()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off_destroyed(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.destroy_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Destroys the entity: fires the destroyed signal, removes it from the
    /// registry and drops its watchers. Owned children are left alone.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.write();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        let listeners: Vec<DestroyListener> = self
            .inner
            .destroy_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(self);
        }
        if let Some(registry) = self.registry() {
            registry.remove(self.gid());
        }
        self.inner.watchers.write().clear();
        self.inner.destroy_listeners.write().clear();
        debug!(gid = %self.gid(), entity_type = self.entity_type(), "mozel destroyed");
    }
}

impl PartialEq for Mozel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Mozel {}

impl fmt::Debug for Mozel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mozel")
            .field("gid", self.gid())
            .field("entity_type", &self.entity_type())
            .finish()
    }
}
