use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::bag::EntityRef;
use crate::{DenormalizeError, EntityId};

/// One step of a path into a value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    /// Index this segment addresses in a sequence, parsing keys like `"0"`.
    #[must_use]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(key) => key.parse().ok(),
        }
    }
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => write!(f, "{key}"),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// Renders a path as `a.b.0` for error messages.
pub(crate) fn display_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

pub(crate) fn path_not_found(path: &[PathSegment]) -> DenormalizeError {
    DenormalizeError::PathNotFound {
        path: display_path(path),
    }
}

/// Borrowed shape of a value, independent of its representation family.
#[derive(Debug)]
pub enum View<'a, V> {
    Null,
    Bool(bool),
    Number(&'a serde_json::Number),
    String(&'a str),
    Sequence(&'a [V]),
    Mapping(&'a BTreeMap<String, V>),
    Entity(EntityRef),
}

impl<V> Clone for View<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for View<'_, V> {}

impl<V> View<'_, V> {
    /// True for sequences, mappings and entity handles.
    #[must_use]
    pub fn is_object_shaped(&self) -> bool {
        matches!(self, Self::Sequence(_) | Self::Mapping(_) | Self::Entity(_))
    }

    /// Reads a bare id. Only strings and numbers qualify.
    #[must_use]
    pub fn as_id(&self) -> Option<EntityId> {
        match self {
            Self::String(value) => Some(EntityId::from(*value)),
            Self::Number(number) => Some(EntityId::from_number(number)),
            _ => None,
        }
    }
}

/// Uniform path-based access over one representation family.
///
/// The engine is written against this trait only. Plain values are mutated in
/// place by [`Accessor::write_path`]; reference-style values return a new
/// version and leave the receiver's earlier clones untouched. In both cases
/// `Clone` produces a value the caller may write to without affecting the
/// original: a deep copy for plain values, a shared copy-on-write handle for
/// reference-style ones.
pub trait Accessor: Clone + Sized {
    /// True when the value uses the persistent path-get/path-set convention.
    fn is_reference_style(&self) -> bool;

    fn view(&self) -> View<'_, Self>;

    /// Follows `path`, returning `None` as soon as a segment is absent.
    fn read_path(&self, path: &[PathSegment]) -> Option<&Self>;

    /// Sets the value at `path`, returning the updated top-level value.
    fn write_path(self, path: &[PathSegment], value: Self) -> Result<Self, DenormalizeError>;

    /// Drops `key` from a mapping. Non-mappings are returned unchanged.
    #[must_use]
    fn remove_key(self, key: &str) -> Self;

    fn null() -> Self;

    fn entity(handle: EntityRef) -> Self;

    fn from_sequence(items: Vec<Self>) -> Self;

    fn from_mapping(entries: BTreeMap<String, Self>) -> Self;

    fn is_null(&self) -> bool {
        matches!(self.view(), View::Null)
    }

    fn as_entity_ref(&self) -> Option<EntityRef> {
        match self.view() {
            View::Entity(handle) => Some(handle),
            _ => None,
        }
    }
}
