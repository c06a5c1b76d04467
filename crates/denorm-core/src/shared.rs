use std::collections::BTreeMap;
use std::sync::Arc;

use crate::accessor::{Accessor, PathSegment, View};
use crate::bag::EntityRef;
use crate::DenormalizeError;

/// Persistent value: containers are shared behind `Arc` and never mutated
/// once another handle can observe them. Every write yields a new version.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SharedValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Arc<Vec<SharedValue>>),
    Map(Arc<BTreeMap<String, SharedValue>>),
    Entity(EntityRef),
}

fn missing(keys: &[String]) -> DenormalizeError {
    DenormalizeError::PathNotFound {
        path: keys.join("."),
    }
}

impl SharedValue {
    #[must_use]
    pub fn empty_map() -> Self {
        Self::Map(Arc::new(BTreeMap::new()))
    }

    /// Path lookup using string keys, the persistent-collection convention.
    #[must_use]
    pub fn get_in(&self, keys: &[String]) -> Option<&Self> {
        keys.iter().try_fold(self, |current, key| match current {
            Self::Map(map) => map.get(key),
            Self::List(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
            _ => None,
        })
    }

    /// Returns a new version with `value` at `keys`. Intermediate mappings
    /// that do not exist yet are created empty.
    pub fn set_in(&self, keys: &[String], value: Self) -> Result<Self, DenormalizeError> {
        let Some((first, rest)) = keys.split_first() else {
            return Ok(value);
        };

        match self {
            Self::Map(map) => {
                let child = match map.get(first) {
                    Some(child) => child.set_in(rest, value)?,
                    None => Self::empty_map().set_in(rest, value)?,
                };
                let mut next = Arc::clone(map);
                Arc::make_mut(&mut next).insert(first.clone(), child);
                Ok(Self::Map(next))
            }
            Self::List(items) => {
                let index = first.parse::<usize>().map_err(|_| missing(keys))?;
                let child = match items.get(index) {
                    Some(child) => child.set_in(rest, value)?,
                    None if index == items.len() => Self::empty_map().set_in(rest, value)?,
                    None => return Err(missing(keys)),
                };
                let mut next = Arc::clone(items);
                let list = Arc::make_mut(&mut next);
                if let Some(slot) = list.get_mut(index) {
                    *slot = child;
                } else {
                    list.push(child);
                }
                Ok(Self::List(next))
            }
            _ => Err(missing(keys)),
        }
    }
}

fn stringified(path: &[PathSegment]) -> Vec<String> {
    path.iter().map(ToString::to_string).collect()
}

impl Accessor for SharedValue {
    fn is_reference_style(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_))
    }

    fn view(&self) -> View<'_, Self> {
        match self {
            Self::Null => View::Null,
            Self::Bool(value) => View::Bool(*value),
            Self::Number(number) => View::Number(number),
            Self::String(value) => View::String(value),
            Self::List(items) => View::Sequence(items.as_slice()),
            Self::Map(map) => View::Mapping(map),
            Self::Entity(handle) => View::Entity(*handle),
        }
    }

    fn read_path(&self, path: &[PathSegment]) -> Option<&Self> {
        self.get_in(&stringified(path))
    }

    fn write_path(self, path: &[PathSegment], value: Self) -> Result<Self, DenormalizeError> {
        self.set_in(&stringified(path), value)
    }

    fn remove_key(self, key: &str) -> Self {
        match self {
            Self::Map(mut map) => {
                if map.contains_key(key) {
                    Arc::make_mut(&mut map).remove(key);
                }
                Self::Map(map)
            }
            other => other,
        }
    }

    fn null() -> Self {
        Self::Null
    }

    fn entity(handle: EntityRef) -> Self {
        Self::Entity(handle)
    }

    fn from_sequence(items: Vec<Self>) -> Self {
        Self::List(Arc::new(items))
    }

    fn from_mapping(entries: BTreeMap<String, Self>) -> Self {
        Self::Map(Arc::new(entries))
    }
}

impl From<serde_json::Value> for SharedValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(value) => Self::Bool(value),
            serde_json::Value::Number(number) => Self::Number(number),
            serde_json::Value::String(value) => Self::String(value),
            serde_json::Value::Array(items) => {
                Self::List(Arc::new(items.into_iter().map(Self::from).collect()))
            }
            serde_json::Value::Object(map) => Self::Map(Arc::new(
                map.into_iter().map(|(key, value)| (key, Self::from(value))).collect(),
            )),
        }
    }
}
