use std::collections::BTreeMap;

use crate::accessor::{path_not_found, Accessor, PathSegment, View};
use crate::bag::EntityRef;
use crate::DenormalizeError;

/// Plain mutable value: objects and arrays owned outright and written in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PlainValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<PlainValue>),
    Object(BTreeMap<String, PlainValue>),
    Entity(EntityRef),
}

impl PlainValue {
    fn child(&self, segment: &PathSegment) -> Option<&Self> {
        match (self, segment) {
            (Self::Object(map), PathSegment::Key(key)) => map.get(key.as_str()),
            (Self::Object(map), PathSegment::Index(index)) => map.get(&index.to_string()),
            (Self::Array(items), segment) => segment.as_index().and_then(|index| items.get(index)),
            _ => None,
        }
    }

    fn child_mut(&mut self, segment: &PathSegment) -> Option<&mut Self> {
        match (self, segment) {
            (Self::Object(map), PathSegment::Key(key)) => map.get_mut(key.as_str()),
            (Self::Object(map), PathSegment::Index(index)) => map.get_mut(&index.to_string()),
            (Self::Array(items), segment) => match segment.as_index() {
                Some(index) => items.get_mut(index),
                None => None,
            },
            _ => None,
        }
    }

    fn read_path_mut(&mut self, path: &[PathSegment]) -> Option<&mut Self> {
        let mut current = self;
        for segment in path {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }
}

impl Accessor for PlainValue {
    fn is_reference_style(&self) -> bool {
        false
    }

    fn view(&self) -> View<'_, Self> {
        match self {
            Self::Null => View::Null,
            Self::Bool(value) => View::Bool(*value),
            Self::Number(number) => View::Number(number),
            Self::String(value) => View::String(value),
            Self::Array(items) => View::Sequence(items),
            Self::Object(map) => View::Mapping(map),
            Self::Entity(handle) => View::Entity(*handle),
        }
    }

    fn read_path(&self, path: &[PathSegment]) -> Option<&Self> {
        path.iter().try_fold(self, |current, segment| current.child(segment))
    }

    fn write_path(mut self, path: &[PathSegment], value: Self) -> Result<Self, DenormalizeError> {
        let Some((last, parent_path)) = path.split_last() else {
            return Err(DenormalizeError::EmptyPath);
        };
        let parent = self.read_path_mut(parent_path).ok_or_else(|| path_not_found(parent_path))?;

        match parent {
            Self::Object(map) => {
                map.insert(last.to_string(), value);
            }
            Self::Array(items) => {
                let index = last.as_index().ok_or_else(|| path_not_found(path))?;
                if let Some(slot) = items.get_mut(index) {
                    *slot = value;
                } else if index == items.len() {
                    items.push(value);
                } else {
                    return Err(path_not_found(path));
                }
            }
            _ => return Err(path_not_found(path)),
        }

        Ok(self)
    }

    fn remove_key(mut self, key: &str) -> Self {
        if let Self::Object(map) = &mut self {
            map.remove(key);
        }
        self
    }

    fn null() -> Self {
        Self::Null
    }

    fn entity(handle: EntityRef) -> Self {
        Self::Entity(handle)
    }

    fn from_sequence(items: Vec<Self>) -> Self {
        Self::Array(items)
    }

    fn from_mapping(entries: BTreeMap<String, Self>) -> Self {
        Self::Object(entries)
    }
}

impl From<serde_json::Value> for PlainValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(value) => Self::Bool(value),
            serde_json::Value::Number(number) => Self::Number(number),
            serde_json::Value::String(value) => Self::String(value),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(key, value)| (key, Self::from(value))).collect())
            }
        }
    }
}
