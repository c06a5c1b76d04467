use std::collections::BTreeMap;

use crate::{DenormalizeError, EntityId};

/// Normalized entities: collection key → id → flat entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStore<V> {
    collections: BTreeMap<String, BTreeMap<EntityId, V>>,
}

impl<V> Default for EntityStore<V> {
    fn default() -> Self {
        Self {
            collections: BTreeMap::new(),
        }
    }
}

impl<V> EntityStore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entity`, returning the one it replaces.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        id: impl Into<EntityId>,
        entity: V,
    ) -> Option<V> {
        self.collections.entry(key.into()).or_default().insert(id.into(), entity)
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, id: impl Into<EntityId>, entity: V) -> Self {
        self.insert(key, id, entity);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str, id: &EntityId) -> Option<&V> {
        self.collections.get(key).and_then(|entities| entities.get(id))
    }

    #[must_use]
    pub fn collection(&self, key: &str) -> Option<&BTreeMap<EntityId, V>> {
        self.collections.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.collections.keys().map(String::as_str)
    }

    /// Total number of entities across collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }
}

impl<V: From<serde_json::Value>> EntityStore<V> {
    /// Builds a store from `{ "<key>": { "<id>": <entity> } }`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, DenormalizeError> {
        let serde_json::Value::Object(collections) = value else {
            return Err(DenormalizeError::InvalidStore(
                "top level must be an object of collections".to_string(),
            ));
        };

        let mut store = Self::new();
        for (key, entities) in collections {
            let serde_json::Value::Object(entities) = entities else {
                return Err(DenormalizeError::InvalidStore(format!(
                    "collection `{key}` must be an object keyed by id"
                )));
            };
            let collection = store.collections.entry(key).or_default();
            for (id, entity) in entities {
                collection.insert(EntityId(id), V::from(entity));
            }
        }
        Ok(store)
    }
}
