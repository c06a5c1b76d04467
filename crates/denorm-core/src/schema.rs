use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DenormalizeError;

pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

fn default_id_attribute() -> String {
    DEFAULT_ID_ATTRIBUTE.to_string()
}

/// Shape of a value and the references embedded in it.
///
/// `Entity` nodes name a collection key; the entity definition itself lives in
/// a [`Catalog`] so that entities can refer to themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    Entity(String),
    Array(Box<Schema>),
    /// Keyed collection. `stored_key` is the field each item carries its key
    /// under; it is stripped from the output. String, number and boolean keys
    /// are used as text; items with any other key are dropped.
    Values {
        schema: Box<Schema>,
        stored_key: String,
    },
    /// Polymorphic reference. The item schema maps discriminator values to
    /// concrete schemas.
    Union(Box<Schema>),
    Object(BTreeMap<String, Schema>),
}

impl Schema {
    #[must_use]
    pub fn entity(key: impl Into<String>) -> Self {
        Self::Entity(key.into())
    }

    #[must_use]
    pub fn array_of(item: Self) -> Self {
        Self::Array(Box::new(item))
    }

    #[must_use]
    pub fn values_of(item: Self, stored_key: impl Into<String>) -> Self {
        Self::Values {
            schema: Box::new(item),
            stored_key: stored_key.into(),
        }
    }

    #[must_use]
    pub fn union_of(item: Self) -> Self {
        Self::Union(Box::new(item))
    }

    #[must_use]
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Self)>,
        K: Into<String>,
    {
        Self::Object(fields.into_iter().map(|(name, schema)| (name.into(), schema)).collect())
    }

    /// Item schema of an array, keyed collection or union.
    #[must_use]
    pub fn item_schema(&self) -> Option<&Self> {
        match self {
            Self::Array(item) | Self::Union(item) | Self::Values { schema: item, .. } => {
                Some(&**item)
            }
            Self::Entity(_) | Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn dictionary_stored_key_name(&self) -> Option<&str> {
        match self {
            Self::Values { stored_key, .. } => Some(stored_key.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Array(_) => "array",
            Self::Values { .. } => "values",
            Self::Union(_) => "union",
            Self::Object(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    key: String,
    #[serde(default = "default_id_attribute")]
    id_attribute: String,
    #[serde(default)]
    fields: BTreeMap<String, Schema>,
}

impl EntitySchema {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id_attribute: default_id_attribute(),
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.fields.insert(name.into(), schema);
        self
    }

    /// Adds or replaces nested field schemas.
    pub fn define<I, K>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(|(name, schema)| (name.into(), schema)));
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Schema> {
        &self.fields
    }
}

/// Entity definitions by collection key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<EntitySchema>", into = "Vec<EntitySchema>")]
pub struct Catalog {
    entities: BTreeMap<String, EntitySchema>,
}

impl Catalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `schema` under its key, returning any definition it replaces.
    pub fn insert(&mut self, schema: EntitySchema) -> Option<EntitySchema> {
        self.entities.insert(schema.key.clone(), schema)
    }

    #[must_use]
    pub fn with(mut self, schema: EntitySchema) -> Self {
        self.insert(schema);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EntitySchema> {
        self.entities.get(key)
    }

    pub fn entity(&self, key: &str) -> Result<&EntitySchema, DenormalizeError> {
        self.get(key).ok_or_else(|| DenormalizeError::UnknownEntitySchema(key.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> + '_ {
        self.entities.values()
    }
}

impl From<Vec<EntitySchema>> for Catalog {
    fn from(schemas: Vec<EntitySchema>) -> Self {
        let mut catalog = Self::new();
        for schema in schemas {
            catalog.insert(schema);
        }
        catalog
    }
}

impl From<Catalog> for Vec<EntitySchema> {
    fn from(catalog: Catalog) -> Self {
        catalog.entities.into_values().collect()
    }
}
