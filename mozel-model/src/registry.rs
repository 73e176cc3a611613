//! The entity registry.
//!
//! An explicit service (never a global) that owns every live entity, resolves
//! gids, assigns numeric gids and announces additions and removals to
//! listeners such as the sync coordinator.

use crate::error::{ModelError, ModelResult};
use crate::mozel::{Mozel, gid_of, validate_data};
use crate::schema::EntitySchema;
use mozel_types::Gid;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

thread_local! {
    /// Entities registered by the `create` calls in progress on this thread,
    /// one frame per call.
    static CREATED: RefCell<Vec<Vec<Mozel>>> = const { RefCell::new(Vec::new()) };
}

/// Handle returned when subscribing to registry or destroy events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// A change in registry membership.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Mozel),
    Removed(Mozel),
}

/// Callback invoked for registry events.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct RegistryInner {
    mozels: RwLock<HashMap<Gid, Mozel>>,
    schemas: RwLock<HashMap<String, Arc<EntitySchema>>>,
    listeners: RwLock<Vec<(ListenerId, RegistryListener)>>,
    highest_gid: Mutex<u64>,
    next_listener: AtomicU64,
}

/// Shared registry of live entities. Clones share the same registry.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Registers (or replaces) the schema for an entity type.
    pub fn define(&self, schema: EntitySchema) {
        self.inner
            .schemas
            .write()
            .insert(schema.entity_type.clone(), Arc::new(schema));
    }

    pub fn schema(&self, entity_type: &str) -> Option<Arc<EntitySchema>> {
        self.inner.schemas.read().get(entity_type).cloned()
    }

    /// Creates an entity from its JSON form. A `gid` key in `data` is used
    /// as identity; otherwise the next numeric gid is assigned. The entity is
    /// announced only after its initial data (and any nested children) is in
    /// place.
    ///
    /// On error, children created for `data` are destroyed again and an
    /// assigned gid is handed out again by the next call.
    pub fn create(&self, entity_type: &str, data: Value) -> ModelResult<Mozel> {
        let schema = self
            .schema(entity_type)
            .ok_or_else(|| ModelError::UnknownEntityType(entity_type.to_string()))?;
        if !data.is_null() {
            validate_data(Some(self), &schema, &data)?;
        }
        let highest_before = *self.inner.highest_gid.lock();
        let gid = match data.get("gid") {
            Some(raw) => gid_of(raw)?,
            None => self.next_gid(),
        };
        if self.contains(&gid) {
            return Err(ModelError::DuplicateGid(gid));
        }
        self.reserve(&gid);

        let mozel = Mozel::new(gid, schema, Arc::downgrade(&self.inner));
        CREATED.with(|frames| frames.borrow_mut().push(Vec::new()));
        let populated = self.populate(&mozel, &data);
        let created = CREATED
            .with(|frames| frames.borrow_mut().pop())
            .unwrap_or_default();

        match populated {
            Ok(()) => {
                CREATED.with(|frames| {
                    if let Some(parent) = frames.borrow_mut().last_mut() {
                        parent.extend(created);
                        parent.push(mozel.clone());
                    }
                });
                Ok(mozel)
            }
            Err(err) => {
                debug!(gid = %mozel.gid(), entity_type, %err, "mozel creation rolled back");
                let reached = created
                    .iter()
                    .chain(std::iter::once(&mozel))
                    .filter_map(|m| m.gid().as_number())
                    .max();
                for child in created.iter().rev() {
                    child.destroy();
                }
                let mut highest = self.inner.highest_gid.lock();
                if reached.is_some_and(|n| n == *highest) {
                    *highest = highest_before;
                }
                Err(err)
            }
        }
    }

    fn populate(&self, mozel: &Mozel, data: &Value) -> ModelResult<()> {
        if !data.is_null() {
            mozel.set_data(data, true)?;
        }
        self.insert(mozel.clone())
    }

    fn insert(&self, mozel: Mozel) -> ModelResult<()> {
        {
            let mut mozels = self.inner.mozels.write();
            if mozels.contains_key(mozel.gid()) {
                return Err(ModelError::DuplicateGid(mozel.gid().clone()));
            }
            mozels.insert(mozel.gid().clone(), mozel.clone());
        }
        debug!(gid = %mozel.gid(), entity_type = mozel.entity_type(), "mozel registered");
        self.emit(&RegistryEvent::Added(mozel));
        Ok(())
    }

    pub(crate) fn remove(&self, gid: &Gid) {
        let removed = self.inner.mozels.write().remove(gid);
        if let Some(mozel) = removed {
            self.emit(&RegistryEvent::Removed(mozel));
        }
    }

    pub fn get(&self, gid: &Gid) -> Option<Mozel> {
        self.inner.mozels.read().get(gid).cloned()
    }

    pub fn contains(&self, gid: &Gid) -> bool {
        self.inner.mozels.read().contains_key(gid)
    }

    /// All live entities, in no particular order.
    pub fn list_all(&self) -> Vec<Mozel> {
        self.inner.mozels.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.mozels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mozels.read().is_empty()
    }

    /// Returns the highest numeric gid ever seen or assigned, plus one.
    pub fn next_gid(&self) -> Gid {
        let existing = self
            .inner
            .mozels
            .read()
            .keys()
            .filter_map(Gid::as_number)
            .max()
            .unwrap_or(0);
        let mut highest = self.inner.highest_gid.lock();
        *highest = (*highest).max(existing) + 1;
        Gid::from_number(*highest)
    }

    fn reserve(&self, gid: &Gid) {
        if let Some(n) = gid.as_number() {
            let mut highest = self.inner.highest_gid.lock();
            *highest = (*highest).max(n);
        }
    }

    /// Subscribes to additions and removals.
    pub fn on_event(&self, listener: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &RegistryEvent) {
        let listeners: Vec<RegistryListener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Destroys every registered entity.
    pub fn clear(&self) {
        for mozel in self.list_all() {
            mozel.destroy();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}
