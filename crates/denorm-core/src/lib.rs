//! Rebuilds nested object graphs from a flat entity store and a schema.
//!
//! The engine walks a [`Schema`], resolves every embedded id against an
//! [`EntityStore`] and records each resolved entity in a [`Bag`]. Entities are
//! handed out as [`EntityRef`] handles into that bag, which is what lets
//! self-referencing graphs terminate and share one value per entity.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod accessor;
mod bag;
mod engine;
mod plain;
mod schema;
mod shared;
mod store;

pub use accessor::{Accessor, PathSegment, View};
pub use bag::{Bag, CyclePolicy, EntityRef};
pub use engine::{
    denormalize, denormalize_with_bag, Denormalized, UNION_ID_FIELD, UNION_SCHEMA_FIELD,
};
pub use plain::PlainValue;
pub use schema::{Catalog, EntitySchema, Schema, DEFAULT_ID_ATTRIBUTE};
pub use shared::SharedValue;
pub use store::EntityStore;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DenormalizeError {
    #[error("cannot write through an empty path")]
    EmptyPath,
    #[error("path not found: {path}")]
    PathNotFound { path: String },
    #[error("no entity schema registered for key `{0}`")]
    UnknownEntitySchema(String),
    #[error("entity handle {0} does not belong to this bag")]
    UnknownEntityRef(EntityRef),
    #[error("cyclic reference to {key}/{id}")]
    CyclicReference { key: String, id: EntityId },
    #[error("invalid entity store: {0}")]
    InvalidStore(String),
}

/// Identifier of an entity within its collection.
///
/// Ids are string-keyed: numeric ids are stored in their decimal form so that
/// `1` and `"1"` address the same entity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id from a JSON number, printing integers without a fraction.
    #[must_use]
    pub fn from_number(number: &serde_json::Number) -> Self {
        if let Some(value) = number.as_i64() {
            return Self(value.to_string());
        }
        if let Some(value) = number.as_u64() {
            return Self(value.to_string());
        }
        match number.as_f64() {
            Some(value) if value.fract() == 0.0 && value.abs() < 9.0e15 => {
                Self(format!("{value:.0}"))
            }
            _ => Self(number.to_string()),
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u32> for EntityId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        Self(value.to_string())
    }
}
