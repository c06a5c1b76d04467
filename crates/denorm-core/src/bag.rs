use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::accessor::{Accessor, View};
use crate::{DenormalizeError, EntityId};

/// Stable handle to an entity slot in a [`Bag`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityRef(usize);

impl EntityRef {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What [`Bag::materialize`] does when an entity is reached inside itself.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum CyclePolicy {
    #[default]
    Error,
    /// Write the entity id (as a string) where the cycle closes.
    EmitId,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    key: String,
    id: EntityId,
    value: V,
    /// Fields removed through [`Bag::strip_key`]; they stay removed when the
    /// slot is filled later.
    stripped: Vec<String>,
}

/// Resolution bag: arena of denormalized entities addressed by
/// `(collection key, id)`.
///
/// A slot is seated before its fields are resolved, so any reference back to
/// the entity found during that resolution receives the same handle. Once a
/// slot exists it stays the single value for that entity for as long as the
/// bag is reused.
#[derive(Debug, Clone)]
pub struct Bag<V> {
    slots: Vec<Slot<V>>,
    index: BTreeMap<String, BTreeMap<EntityId, EntityRef>>,
}

impl<V> Default for Bag<V> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<V: Accessor> Bag<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn lookup(&self, key: &str, id: &EntityId) -> Option<EntityRef> {
        self.index.get(key).and_then(|ids| ids.get(id)).copied()
    }

    #[must_use]
    pub fn get(&self, handle: EntityRef) -> Option<&V> {
        self.slots.get(handle.0).map(|slot| &slot.value)
    }

    /// Collection key and id the handle was seated under.
    #[must_use]
    pub fn entry(&self, handle: EntityRef) -> Option<(&str, &EntityId)> {
        self.slots.get(handle.0).map(|slot| (slot.key.as_str(), &slot.id))
    }

    /// Follows an entity handle to its value; other values resolve to themselves.
    #[must_use]
    pub fn resolve<'a>(&'a self, value: &'a V) -> Option<&'a V> {
        match value.as_entity_ref() {
            Some(handle) => self.get(handle),
            None => Some(value),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, &str, &EntityId, &V)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (EntityRef(index), slot.key.as_str(), &slot.id, &slot.value))
    }

    pub(crate) fn seat(&mut self, key: &str, id: EntityId, placeholder: V) -> EntityRef {
        let handle = EntityRef(self.slots.len());
        self.index.entry(key.to_string()).or_default().insert(id.clone(), handle);
        self.slots.push(Slot {
            key: key.to_string(),
            id,
            value: placeholder,
            stripped: Vec::new(),
        });
        handle
    }

    pub(crate) fn fill(&mut self, handle: EntityRef, value: V) -> Result<(), DenormalizeError> {
        let slot =
            self.slots.get_mut(handle.0).ok_or(DenormalizeError::UnknownEntityRef(handle))?;
        slot.value = slot.stripped.iter().fold(value, |value, field| value.remove_key(field));
        Ok(())
    }

    /// Removes `field` from the entity in this slot, including from a value
    /// the slot is filled with afterwards.
    pub(crate) fn strip_key(
        &mut self,
        handle: EntityRef,
        field: &str,
    ) -> Result<(), DenormalizeError> {
        let slot =
            self.slots.get_mut(handle.0).ok_or(DenormalizeError::UnknownEntityRef(handle))?;
        let current = std::mem::replace(&mut slot.value, V::null());
        slot.value = current.remove_key(field);
        if !slot.stripped.iter().any(|stripped| stripped == field) {
            slot.stripped.push(field.to_string());
        }
        Ok(())
    }

    /// Flattens a denormalized value into plain JSON by expanding entity
    /// handles. Shared references are expanded at every occurrence; a handle
    /// met again inside its own expansion is handled per `policy`.
    pub fn materialize(
        &self,
        value: &V,
        policy: CyclePolicy,
    ) -> Result<serde_json::Value, DenormalizeError> {
        let mut ancestors = Vec::new();
        self.materialize_into(value, policy, &mut ancestors)
    }

    fn materialize_into(
        &self,
        value: &V,
        policy: CyclePolicy,
        ancestors: &mut Vec<EntityRef>,
    ) -> Result<serde_json::Value, DenormalizeError> {
        match value.view() {
            View::Null => Ok(serde_json::Value::Null),
            View::Bool(flag) => Ok(serde_json::Value::Bool(flag)),
            View::Number(number) => Ok(serde_json::Value::Number(number.clone())),
            View::String(text) => Ok(serde_json::Value::String(text.to_string())),
            View::Sequence(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.materialize_into(item, policy, ancestors)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            View::Mapping(map) => {
                let mut out = serde_json::Map::new();
                for (key, child) in map {
                    out.insert(key.clone(), self.materialize_into(child, policy, ancestors)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            View::Entity(handle) => {
                let slot =
                    self.slots.get(handle.0).ok_or(DenormalizeError::UnknownEntityRef(handle))?;
                if ancestors.contains(&handle) {
                    return match policy {
                        CyclePolicy::Error => Err(DenormalizeError::CyclicReference {
                            key: slot.key.clone(),
                            id: slot.id.clone(),
                        }),
                        CyclePolicy::EmitId => Ok(serde_json::Value::String(slot.id.0.clone())),
                    };
                }
                ancestors.push(handle);
                let expanded = self.materialize_into(&slot.value, policy, ancestors);
                ancestors.pop();
                expanded
            }
        }
    }
}
