use serde::{Deserialize, Serialize};

/// Describes an entity type's named slots.
///
/// Every [`crate::Mozel`] is created against a schema registered with the
/// [`crate::Registry`]; the schema decides how incoming JSON is interpreted
/// for each property (plain data, an owned child entity, a reference, or a
/// collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub properties: Vec<PropertyDef>,
}

impl EntitySchema {
    /// Creates an empty schema for the given entity type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            properties: Vec::new(),
        }
    }

    /// Adds a property definition.
    #[must_use]
    pub fn with(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Looks up a property definition by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// A single named slot on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    pub kind: PropertyKind,
    /// Reference properties hold a gid that is resolved through the registry
    /// on access. They never own (or create) the entity they point to.
    #[serde(default)]
    pub reference: bool,
}

impl PropertyDef {
    fn simple(name: &str, kind: PropertyKind, reference: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            reference,
        }
    }

    /// Shorthand for a plain JSON data property.
    pub fn data(name: &str) -> Self {
        Self::simple(name, PropertyKind::Data, false)
    }

    /// Shorthand for an owned child entity property.
    pub fn entity(name: &str, entity_type: &str) -> Self {
        Self::simple(
            name,
            PropertyKind::Entity {
                entity_type: entity_type.into(),
            },
            false,
        )
    }

    /// Shorthand for a non-owning reference to another entity.
    pub fn reference(name: &str, entity_type: &str) -> Self {
        Self::simple(
            name,
            PropertyKind::Entity {
                entity_type: entity_type.into(),
            },
            true,
        )
    }

    /// Shorthand for a collection of plain JSON values.
    pub fn data_collection(name: &str) -> Self {
        Self::simple(
            name,
            PropertyKind::Collection {
                item: ItemKind::Data,
            },
            false,
        )
    }

    /// Shorthand for a collection of owned child entities.
    pub fn entity_collection(name: &str, entity_type: &str) -> Self {
        Self::simple(
            name,
            PropertyKind::Collection {
                item: ItemKind::Entity {
                    entity_type: entity_type.into(),
                },
            },
            false,
        )
    }
}

/// What a property holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    /// Arbitrary JSON.
    Data,
    /// A single child entity (or a reference when `PropertyDef::reference`).
    Entity { entity_type: String },
    /// An ordered list of items, synchronized as one whole value.
    Collection { item: ItemKind },
}

/// What a collection item holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    Data,
    Entity { entity_type: String },
}
