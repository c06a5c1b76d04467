use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::accessor::{Accessor, PathSegment, View};
use crate::bag::{Bag, CyclePolicy};
use crate::schema::{Catalog, EntitySchema, Schema};
use crate::store::EntityStore;
use crate::{DenormalizeError, EntityId};

/// Field a union value carries its id under.
pub const UNION_ID_FIELD: &str = "id";
/// Field a union value carries its discriminator under.
pub const UNION_SCHEMA_FIELD: &str = "schema";

/// Result of a top-level call: the root value plus the bag its entity
/// handles point into. `value` is `None` when the root did not resolve.
#[derive(Debug, Clone)]
pub struct Denormalized<V> {
    pub value: Option<V>,
    pub bag: Bag<V>,
}

impl<V: Accessor> Denormalized<V> {
    /// Root value with a top-level entity handle followed.
    #[must_use]
    pub fn root(&self) -> Option<&V> {
        self.value.as_ref().and_then(|value| self.bag.resolve(value))
    }

    pub fn to_json(
        &self,
        policy: CyclePolicy,
    ) -> Result<Option<serde_json::Value>, DenormalizeError> {
        self.value.as_ref().map(|value| self.bag.materialize(value, policy)).transpose()
    }
}

/// Denormalizes `value` against `schema` with a fresh bag.
///
/// Passing `None` as the schema returns the value unchanged.
pub fn denormalize<'s, V: Accessor>(
    value: &V,
    entities: &EntityStore<V>,
    catalog: &Catalog,
    schema: impl Into<Option<&'s Schema>>,
) -> Result<Denormalized<V>, DenormalizeError> {
    let mut bag = Bag::new();
    let value = denormalize_with_bag(value, entities, catalog, schema, &mut bag)?;
    Ok(Denormalized { value, bag })
}

/// Denormalizes `value` into a caller-owned bag. Entities already seated in
/// `bag` are reused as-is, so repeated calls hand back the same handles.
pub fn denormalize_with_bag<'s, V: Accessor>(
    value: &V,
    entities: &EntityStore<V>,
    catalog: &Catalog,
    schema: impl Into<Option<&'s Schema>>,
    bag: &mut Bag<V>,
) -> Result<Option<V>, DenormalizeError> {
    let mut walker = Walker {
        entities,
        catalog,
        bag,
    };
    walker.denormalize(value, schema.into())
}

/// Takes either an object-shaped entity or a bare id and derives the other.
fn resolve_entity_or_id<'v, V: Accessor>(
    entities: &'v EntityStore<V>,
    value: &'v V,
    schema: &EntitySchema,
) -> (Option<EntityId>, Option<&'v V>) {
    let view = value.view();
    if view.is_object_shaped() {
        let id = value
            .read_path(&[PathSegment::from(schema.id_attribute())])
            .and_then(|id| id.view().as_id());
        return (id, Some(value));
    }

    let id = view.as_id();
    let entity = id.as_ref().and_then(|id| entities.get(schema.key(), id));
    (id, entity)
}

struct Walker<'a, V> {
    entities: &'a EntityStore<V>,
    catalog: &'a Catalog,
    bag: &'a mut Bag<V>,
}

impl<V: Accessor> Walker<'_, V> {
    fn denormalize(
        &mut self,
        value: &V,
        schema: Option<&Schema>,
    ) -> Result<Option<V>, DenormalizeError> {
        let Some(schema) = schema else {
            return Ok(Some(value.clone()));
        };
        if value.is_null() {
            return Ok(Some(value.clone()));
        }

        trace!(variant = schema.variant_name(), "denormalizing");
        match schema {
            Schema::Entity(key) => {
                let catalog = self.catalog;
                self.entity(value, catalog.entity(key)?)
            }
            Schema::Values { schema: item, stored_key } => self.keyed(value, item, stored_key),
            Schema::Array(item) => self.iterable(value, item),
            Schema::Union(item) => self.union(value, item),
            // Clone is the defensive copy: deep for plain values, shared for
            // reference-style ones.
            Schema::Object(fields) => self.object(value.clone(), fields).map(Some),
        }
    }

    fn entity(&mut self, value: &V, schema: &EntitySchema) -> Result<Option<V>, DenormalizeError> {
        if value.as_entity_ref().is_some() {
            return Ok(Some(value.clone()));
        }

        let key = schema.key();
        let entities = self.entities;
        let (id, entity) = resolve_entity_or_id(entities, value, schema);

        let Some(id) = id else {
            return match entity {
                Some(entity) => {
                    debug!(%key, "entity has no id, resolving inline");
                    self.object(entity.clone(), schema.fields()).map(Some)
                }
                None => Ok(None),
            };
        };

        if let Some(handle) = self.bag.lookup(key, &id) {
            debug!(%key, %id, %handle, "entity already seated");
            return Ok(Some(V::entity(handle)));
        }

        let Some(entity) = entity else {
            debug!(%key, %id, "entity missing from store");
            return Ok(None);
        };

        // Seat before recursing so references back to this entity find it.
        let working = entity.clone();
        let handle = self.bag.seat(key, id, working.clone());
        debug!(
            %key,
            %handle,
            reference_style = working.is_reference_style(),
            "seated entity"
        );
        let resolved = self.object(working, schema.fields())?;
        self.bag.fill(handle, resolved)?;
        Ok(Some(V::entity(handle)))
    }

    /// Resolves every field named by `fields` that is present on `value`.
    /// Fields that resolve to nothing are removed.
    fn object(
        &mut self,
        mut value: V,
        fields: &BTreeMap<String, Schema>,
    ) -> Result<V, DenormalizeError> {
        for (attribute, field_schema) in fields {
            let path = [PathSegment::from(attribute.as_str())];
            let Some(current) = value.read_path(&path) else {
                continue;
            };
            value = match self.denormalize(current, Some(field_schema))? {
                Some(resolved) => value.write_path(&path, resolved)?,
                None => value.remove_key(attribute),
            };
        }
        Ok(value)
    }

    fn iterable(&mut self, value: &V, item: &Schema) -> Result<Option<V>, DenormalizeError> {
        let View::Sequence(items) = value.view() else {
            trace!("non-sequence value passed through array schema");
            return Ok(Some(value.clone()));
        };

        let mut resolved = Vec::with_capacity(items.len());
        for element in items {
            resolved.push(self.denormalize(element, Some(item))?.unwrap_or_else(V::null));
        }
        Ok(Some(V::from_sequence(resolved)))
    }

    fn keyed(
        &mut self,
        value: &V,
        item: &Schema,
        stored_key: &str,
    ) -> Result<Option<V>, DenormalizeError> {
        let mut result = BTreeMap::new();
        match value.view() {
            View::Mapping(map) => {
                for (key, element) in map {
                    if let Some(resolved) = self.denormalize(element, Some(item))? {
                        result.insert(key.clone(), self.strip(resolved, stored_key)?);
                    }
                }
            }
            View::Sequence(items) => {
                for element in items {
                    let Some(resolved) = self.denormalize(element, Some(item))? else {
                        continue;
                    };
                    let Some(key) = self.stored_key_of(&resolved, stored_key) else {
                        debug!(%stored_key, "keyed item has no stored key, dropping it");
                        continue;
                    };
                    result.insert(key.0, self.strip(resolved, stored_key)?);
                }
            }
            _ => {
                trace!("non-collection value passed through values schema");
                return Ok(Some(value.clone()));
            }
        }
        Ok(Some(V::from_mapping(result)))
    }

    fn stored_key_of(&self, resolved: &V, stored_key: &str) -> Option<EntityId> {
        self.bag
            .resolve(resolved)?
            .read_path(&[PathSegment::from(stored_key)])
            .and_then(|key| match key.view() {
                View::Bool(flag) => Some(EntityId::from(flag.to_string())),
                view => view.as_id(),
            })
    }

    /// Drops the stored key from an item. Entity items are stripped in their
    /// bag slot, so every reference to that entity sees the change, including
    /// an ancestor that is still being resolved.
    fn strip(&mut self, resolved: V, stored_key: &str) -> Result<V, DenormalizeError> {
        match resolved.as_entity_ref() {
            Some(handle) => {
                self.bag.strip_key(handle, stored_key)?;
                Ok(resolved)
            }
            None => Ok(resolved.remove_key(stored_key)),
        }
    }

    fn union(&mut self, value: &V, item: &Schema) -> Result<Option<V>, DenormalizeError> {
        let id = value.read_path(&[PathSegment::from(UNION_ID_FIELD)]);
        let discriminator = value
            .read_path(&[PathSegment::from(UNION_SCHEMA_FIELD)])
            .and_then(|discriminator| discriminator.view().as_id());
        let (Some(id), Some(discriminator)) = (id, discriminator) else {
            debug!("union value without id or discriminator");
            return Ok(None);
        };

        let wrapper = V::from_mapping(BTreeMap::from([(discriminator.0.clone(), id.clone())]));
        let resolved = self.denormalize(&wrapper, Some(item))?;
        let path = [PathSegment::from(discriminator.0)];
        Ok(resolved.and_then(|resolved| resolved.read_path(&path).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::*;
    use crate::{EntityRef, PlainValue, SharedValue};

    fn user_catalog() -> Catalog {
        Catalog::new()
            .with(EntitySchema::new("users").field("bestFriend", Schema::entity("users")))
            .with(
                EntitySchema::new("groups")
                    .field("owner", Schema::entity("users"))
                    .field("members", Schema::array_of(Schema::entity("users"))),
            )
    }

    fn store<V: Accessor + From<Value>>(value: Value) -> EntityStore<V> {
        EntityStore::from_json(value)
            .unwrap_or_else(|err| panic!("fixture store should parse: {err}"))
    }

    fn run<V: Accessor + From<Value>>(
        value: Value,
        entities: &EntityStore<V>,
        schema: &Schema,
    ) -> Denormalized<V> {
        denormalize(&V::from(value), entities, &user_catalog(), schema)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"))
    }

    fn flat<V: Accessor>(result: &Denormalized<V>) -> Value {
        result
            .to_json(CyclePolicy::Error)
            .unwrap_or_else(|err| panic!("materialize should succeed: {err}"))
            .unwrap_or_else(|| panic!("root should resolve"))
    }

    fn field<V: Accessor>(bag: &Bag<V>, value: &V, name: &str) -> V {
        bag.resolve(value)
            .and_then(|entity| entity.read_path(&[PathSegment::from(name)]))
            .cloned()
            .unwrap_or_else(|| panic!("field `{name}` should be present"))
    }

    fn handle_of<V: Accessor>(value: &V) -> EntityRef {
        value.as_entity_ref().unwrap_or_else(|| panic!("value should be an entity handle"))
    }

    #[test]
    fn leaves_pass_through_without_a_schema() {
        let entities = store::<PlainValue>(json!({}));
        let value = PlainValue::from(json!({"id": 1, "bestFriend": 2}));

        let result = denormalize(&value, &entities, &user_catalog(), None::<&Schema>)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        assert_eq!(result.value, Some(value));
        assert!(result.bag.is_empty());
    }

    #[test]
    fn null_values_are_returned_unchanged() {
        let entities = store::<PlainValue>(json!({"users": {}}));
        let result = run(Value::Null, &entities, &Schema::entity("users"));
        assert_eq!(result.value, Some(PlainValue::Null));
    }

    #[test]
    fn id_resolves_against_the_store() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "name": "A"}}}));
        let result = run(json!(1), &entities, &Schema::entity("users"));

        assert_eq!(flat(&result), json!({"id": 1, "name": "A"}));
        assert_eq!(result.bag.len(), 1);
    }

    #[test]
    fn mutual_references_terminate_and_share_the_same_entity() {
        let entities = store::<PlainValue>(json!({
            "users": {
                "1": {"id": 1, "bestFriend": 2},
                "2": {"id": 2, "bestFriend": 1}
            }
        }));
        let result = run(json!(1), &entities, &Schema::entity("users"));

        let root = result.value.clone().unwrap_or_else(|| panic!("root should resolve"));
        let friend = field(&result.bag, &root, "bestFriend");
        let friend_of_friend = field(&result.bag, &friend, "bestFriend");

        assert_eq!(handle_of(&friend_of_friend), handle_of(&root));
        assert_ne!(handle_of(&friend), handle_of(&root));
        assert_eq!(result.bag.len(), 2);
    }

    #[test]
    fn self_reference_points_back_at_itself() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "bestFriend": 1}}}));
        let result = run(json!(1), &entities, &Schema::entity("users"));

        let root = result.value.clone().unwrap_or_else(|| panic!("root should resolve"));
        assert_eq!(handle_of(&field(&result.bag, &root, "bestFriend")), handle_of(&root));
        assert_eq!(
            result.to_json(CyclePolicy::EmitId).unwrap_or_else(|err| panic!("materialize: {err}")),
            Some(json!({"id": 1, "bestFriend": "1"}))
        );
    }

    #[test]
    fn transitive_cycles_across_collections_terminate() {
        let entities = store::<PlainValue>(json!({
            "users": {"1": {"id": 1, "name": "A", "group": "g"}},
            "groups": {"g": {"id": "g", "owner": 1, "members": [1]}}
        }));
        let catalog = user_catalog().with(
            EntitySchema::new("users")
                .field("bestFriend", Schema::entity("users"))
                .field("group", Schema::entity("groups")),
        );

        let value = PlainValue::from(json!("g"));
        let result = denormalize(&value, &entities, &catalog, &Schema::entity("groups"))
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        let group = result.value.clone().unwrap_or_else(|| panic!("group should resolve"));
        let owner = field(&result.bag, &group, "owner");
        assert_eq!(handle_of(&field(&result.bag, &owner, "group")), handle_of(&group));
        let members = field(&result.bag, &group, "members");
        let View::Sequence(members) = members.view() else {
            panic!("members should stay a sequence");
        };
        assert_eq!(members.iter().map(handle_of).collect::<Vec<_>>(), vec![handle_of(&owner)]);
    }

    #[test]
    fn ordered_collections_keep_input_order() {
        let entities = store::<PlainValue>(json!({
            "users": {"1": {"id": 1, "name": "A"}, "2": {"id": 2, "name": "B"}}
        }));
        let result = run(json!([2, 1]), &entities, &Schema::array_of(Schema::entity("users")));

        assert_eq!(flat(&result), json!([{"id": 2, "name": "B"}, {"id": 1, "name": "A"}]));
    }

    #[test]
    fn missing_elements_become_null_in_sequences() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1}}}));
        let result = run(json!([1, 5]), &entities, &Schema::array_of(Schema::entity("users")));

        assert_eq!(flat(&result), json!([{"id": 1}, null]));
    }

    #[test]
    fn keyed_collection_from_tagged_list_promotes_the_stored_key() {
        let entities = store::<PlainValue>(json!({"users": {}}));
        let schema = Schema::values_of(Schema::entity("users"), "groupId");
        let result = run(
            json!([
                {"id": 1, "name": "A", "groupId": "g1"},
                {"id": 2, "name": "B", "groupId": "g2"}
            ]),
            &entities,
            &schema,
        );

        assert_eq!(
            flat(&result),
            json!({"g1": {"id": 1, "name": "A"}, "g2": {"id": 2, "name": "B"}})
        );
    }

    #[test]
    fn keyed_collection_from_mapping_keeps_keys_and_strips_stored_key() {
        let entities = store::<PlainValue>(json!({
            "users": {
                "1": {"id": 1, "name": "A", "groupId": "g1"},
                "2": {"id": 2, "name": "B", "groupId": "g2"}
            }
        }));
        let schema = Schema::values_of(Schema::entity("users"), "groupId");
        let result = run(json!({"first": 1, "second": 2}), &entities, &schema);

        assert_eq!(
            flat(&result),
            json!({"first": {"id": 1, "name": "A"}, "second": {"id": 2, "name": "B"}})
        );
    }

    #[test]
    fn keyed_items_without_a_stored_key_are_dropped() {
        let entities = store::<PlainValue>(json!({}));
        let item = Schema::object([("unused", Schema::entity("users"))]);
        let schema = Schema::values_of(item, "slot");
        let result = run(json!([{"slot": "a", "v": 1}, {"v": 2}]), &entities, &schema);

        assert_eq!(flat(&result), json!({"a": {"v": 1}}));
    }

    #[test]
    fn union_resolves_to_the_unwrapped_variant() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "name": "A"}}}));
        let schema = Schema::union_of(Schema::object([
            ("user", Schema::entity("users")),
            ("group", Schema::entity("groups")),
        ]));
        let result = run(json!({"id": 1, "schema": "user"}), &entities, &schema);

        assert_eq!(flat(&result), json!({"id": 1, "name": "A"}));
    }

    #[test]
    fn union_without_discriminator_is_undefined() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1}}}));
        let schema = Schema::union_of(Schema::object([("user", Schema::entity("users"))]));
        let result = run(json!({"id": 1}), &entities, &schema);

        assert_eq!(result.value, None);
    }

    #[test]
    fn missing_reference_is_undefined_and_not_seated() {
        let entities = store::<PlainValue>(json!({"users": {"2": {"id": 2}}}));
        let result = run(json!(1), &entities, &Schema::entity("users"));

        assert_eq!(result.value, None);
        assert!(result.bag.is_empty());
    }

    #[test]
    fn missing_nested_reference_removes_the_field() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "bestFriend": 9}}}));
        let result = run(json!(1), &entities, &Schema::entity("users"));

        assert_eq!(flat(&result), json!({"id": 1}));
    }

    #[test]
    fn plain_object_schema_resolves_nested_fields_only() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "name": "A"}}}));
        let schema = Schema::object([
            ("author", Schema::entity("users")),
            ("reviewer", Schema::entity("users")),
        ]);
        let result = run(json!({"author": 1, "title": "T"}), &entities, &schema);

        assert_eq!(flat(&result), json!({"author": {"id": 1, "name": "A"}, "title": "T"}));
    }

    #[test]
    fn object_shaped_entities_use_the_id_attribute() {
        let catalog = Catalog::new().with(
            EntitySchema::new("users")
                .with_id_attribute("uid")
                .field("bestFriend", Schema::entity("users")),
        );
        let entities = store::<PlainValue>(json!({"users": {"u2": {"uid": "u2", "name": "B"}}}));
        let value = PlainValue::from(json!({"uid": "u1", "bestFriend": "u2"}));

        let result = denormalize(&value, &entities, &catalog, &Schema::entity("users"))
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        assert!(result.bag.lookup("users", &EntityId::from("u1")).is_some());
        assert_eq!(flat(&result), json!({"uid": "u1", "bestFriend": {"uid": "u2", "name": "B"}}));
    }

    #[test]
    fn object_without_id_resolves_inline() {
        let entities = store::<PlainValue>(json!({"users": {"2": {"id": 2}}}));
        let result = run(json!({"bestFriend": 2}), &entities, &Schema::entity("users"));

        assert_eq!(result.value.as_ref().and_then(Accessor::as_entity_ref), None);
        assert_eq!(flat(&result), json!({"bestFriend": {"id": 2}}));
    }

    #[test]
    fn unknown_entity_schema_is_an_error() {
        let entities = store::<PlainValue>(json!({}));
        let value = PlainValue::from(json!(1));
        let err = denormalize(&value, &entities, &Catalog::new(), &Schema::entity("users"))
            .err()
            .unwrap_or_else(|| panic!("unregistered key should fail"));

        assert_eq!(err, DenormalizeError::UnknownEntitySchema("users".to_string()));
    }

    #[test]
    fn shared_bag_returns_the_same_handle_without_recomputing() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1, "bestFriend": 1}}}));
        let catalog = user_catalog();
        let schema = Schema::entity("users");
        let mut bag = Bag::new();

        let by_number = PlainValue::from(json!(1));
        let by_string = PlainValue::from(json!("1"));

        let first = denormalize_with_bag(&by_number, &entities, &catalog, &schema, &mut bag)
            .unwrap_or_else(|err| panic!("first call should succeed: {err}"));
        let seated = bag.len();
        let second = denormalize_with_bag(&by_string, &entities, &catalog, &schema, &mut bag)
            .unwrap_or_else(|err| panic!("second call should succeed: {err}"));

        assert_eq!(first, second);
        assert_eq!(bag.len(), seated);
    }

    #[test]
    fn entity_handles_are_not_resolved_twice() {
        let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1}}}));
        let catalog = user_catalog();
        let schema = Schema::entity("users");
        let mut bag = Bag::new();

        let value = PlainValue::from(json!(1));
        let handle = denormalize_with_bag(&value, &entities, &catalog, &schema, &mut bag)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"))
            .unwrap_or_else(|| panic!("entity should resolve"));
        let again = denormalize_with_bag(&handle, &entities, &catalog, &schema, &mut bag)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        assert_eq!(again, Some(handle));
    }

    #[test]
    fn plain_store_is_left_untouched() {
        let entities = store::<PlainValue>(json!({
            "users": {
                "1": {"id": 1, "bestFriend": 2, "groupId": "g1"},
                "2": {"id": 2, "bestFriend": 1, "groupId": "g2"}
            }
        }));
        let before = entities.clone();

        let schema = Schema::values_of(Schema::entity("users"), "groupId");
        let _ = run(json!([1, 2]), &entities, &schema);

        assert_eq!(entities, before);
    }

    #[test]
    fn shared_entities_thread_new_versions_and_share_untouched_subtrees() {
        let entities = store::<SharedValue>(json!({
            "users": {
                "1": {"id": 1, "profile": {"bio": "long"}, "bestFriend": 2},
                "2": {"id": 2, "profile": {"bio": "short"}}
            }
        }));
        let before = entities.clone();
        let result = run(json!(1), &entities, &Schema::entity("users"));

        assert_eq!(entities, before);
        assert_eq!(
            flat(&result),
            json!({
                "id": 1,
                "profile": {"bio": "long"},
                "bestFriend": {"id": 2, "profile": {"bio": "short"}}
            })
        );

        let stored = entities
            .get("users", &EntityId::from("1"))
            .and_then(|user| user.read_path(&[PathSegment::from("profile")]));
        let resolved =
            result.root().and_then(|user| user.read_path(&[PathSegment::from("profile")]));
        let (Some(SharedValue::Map(stored)), Some(SharedValue::Map(resolved))) = (stored, resolved)
        else {
            panic!("profile should be a map in both the store and the result");
        };
        assert!(Arc::ptr_eq(stored, resolved));
    }

    #[test]
    fn shared_sequences_stay_reference_style() {
        let entities = store::<SharedValue>(json!({"users": {"1": {"id": 1}}}));
        let result = run(json!([1]), &entities, &Schema::array_of(Schema::entity("users")));

        let root = result.value.clone().unwrap_or_else(|| panic!("root should resolve"));
        assert!(root.is_reference_style());
        assert_eq!(flat(&result), json!([{"id": 1}]));
    }

    fn friends_catalog() -> Catalog {
        Catalog::new().with(
            EntitySchema::new("users")
                .field("bestFriend", Schema::entity("users"))
                .field("friends", Schema::values_of(Schema::entity("users"), "groupId")),
        )
    }

    fn resolve_with_friends<V: Accessor + From<Value>>(store_json: Value) -> Denormalized<V> {
        let entities = store::<V>(store_json);
        denormalize(&V::from(json!(1)), &entities, &friends_catalog(), &Schema::entity("users"))
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"))
    }

    fn emit_ids<V: Accessor>(result: &Denormalized<V>) -> Value {
        result
            .to_json(CyclePolicy::EmitId)
            .unwrap_or_else(|err| panic!("materialize should succeed: {err}"))
            .unwrap_or_else(|| panic!("root should resolve"))
    }

    fn stored_key_is_stripped_from_an_entity_keyed_inside_itself<V: Accessor + From<Value>>() {
        let result = resolve_with_friends::<V>(json!({
            "users": {"1": {"id": 1, "groupId": "g1", "friends": [1]}}
        }));

        let root = result.value.clone().unwrap_or_else(|| panic!("root should resolve"));
        let entity = result.bag.resolve(&root).unwrap_or_else(|| panic!("root should be seated"));
        assert!(entity.read_path(&[PathSegment::from("groupId")]).is_none());
        assert_eq!(emit_ids(&result), json!({"id": 1, "friends": {"g1": "1"}}));
    }

    #[test]
    fn plain_stored_key_is_stripped_from_an_entity_keyed_inside_itself() {
        stored_key_is_stripped_from_an_entity_keyed_inside_itself::<PlainValue>();
    }

    #[test]
    fn shared_stored_key_is_stripped_from_an_entity_keyed_inside_itself() {
        stored_key_is_stripped_from_an_entity_keyed_inside_itself::<SharedValue>();
    }

    fn stored_key_is_stripped_from_an_ancestor_keyed_by_a_descendant<V: Accessor + From<Value>>() {
        let result = resolve_with_friends::<V>(json!({
            "users": {
                "1": {"id": 1, "groupId": "g1", "bestFriend": 2},
                "2": {"id": 2, "groupId": "g2", "friends": [1]}
            }
        }));

        assert_eq!(
            emit_ids(&result),
            json!({
                "id": 1,
                "bestFriend": {"id": 2, "groupId": "g2", "friends": {"g1": "1"}}
            })
        );
    }

    #[test]
    fn plain_stored_key_is_stripped_from_an_ancestor_keyed_by_a_descendant() {
        stored_key_is_stripped_from_an_ancestor_keyed_by_a_descendant::<PlainValue>();
    }

    #[test]
    fn shared_stored_key_is_stripped_from_an_ancestor_keyed_by_a_descendant() {
        stored_key_is_stripped_from_an_ancestor_keyed_by_a_descendant::<SharedValue>();
    }

    #[test]
    fn boolean_stored_keys_are_used_as_text() {
        let entities = store::<PlainValue>(json!({}));
        let item = Schema::object([("unused", Schema::entity("users"))]);
        let schema = Schema::values_of(item, "flag");
        let value = json!([{"flag": true, "v": 1}, {"flag": false, "v": 2}]);
        let result = run(value, &entities, &schema);

        assert_eq!(flat(&result), json!({"true": {"v": 1}, "false": {"v": 2}}));
    }

    #[test]
    fn shared_union_resolves_without_touching_the_input() {
        let entities = store::<SharedValue>(json!({"users": {"1": {"id": 1, "name": "A"}}}));
        let schema = Schema::union_of(Schema::object([
            ("user", Schema::entity("users")),
            ("group", Schema::entity("groups")),
        ]));
        let value = SharedValue::from(json!({"id": 1, "schema": "user"}));
        let before = value.clone();

        let result = denormalize(&value, &entities, &user_catalog(), &schema)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        assert_eq!(value, before);
        let root = result.root().unwrap_or_else(|| panic!("union should resolve"));
        assert!(root.is_reference_style());
        assert_eq!(flat(&result), json!({"id": 1, "name": "A"}));
    }

    #[test]
    fn shared_object_schema_writes_a_new_version() {
        let entities = store::<SharedValue>(json!({"users": {"1": {"id": 1, "name": "A"}}}));
        let schema = Schema::object([("author", Schema::entity("users"))]);
        let value = SharedValue::from(json!({"author": 1, "meta": {"tags": ["x"]}}));
        let before = value.clone();

        let result = denormalize(&value, &entities, &user_catalog(), &schema)
            .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));

        assert_eq!(value, before);
        assert_eq!(
            flat(&result),
            json!({"author": {"id": 1, "name": "A"}, "meta": {"tags": ["x"]}})
        );

        let root = result.root().unwrap_or_else(|| panic!("object should resolve"));
        let (SharedValue::Map(input), SharedValue::Map(output)) = (&value, root) else {
            panic!("input and result should both be maps");
        };
        assert!(!Arc::ptr_eq(input, output));
        let meta = [PathSegment::from("meta")];
        let (Some(SharedValue::Map(input_meta)), Some(SharedValue::Map(output_meta))) =
            (value.read_path(&meta), root.read_path(&meta))
        else {
            panic!("meta should be a map on both sides");
        };
        assert!(Arc::ptr_eq(input_meta, output_meta));
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn property_leaves_are_identity(leaf in scalar()) {
            let entities = store::<PlainValue>(json!({"users": {"1": {"id": 1}}}));
            let value = PlainValue::from(leaf);
            let result = denormalize(&value, &entities, &user_catalog(), None::<&Schema>)
                .unwrap_or_else(|err| panic!("denormalize should succeed: {err}"));
            prop_assert_eq!(result.value, Some(value));
        }

        #[test]
        fn property_sequences_preserve_order_and_arity(
            ids in proptest::collection::vec(0_u64..20, 0..32)
        ) {
            let mut entities = EntityStore::new();
            for id in 0_u64..20 {
                let user = PlainValue::from(json!({"id": id, "name": format!("n{id}")}));
                entities.insert("users", id, user);
            }
            let before = entities.clone();

            let schema = Schema::array_of(Schema::entity("users"));
            let result = run(json!(ids.clone()), &entities, &schema);
            let expected = ids
                .iter()
                .map(|id| json!({"id": id, "name": format!("n{id}")}))
                .collect::<Vec<_>>();

            prop_assert_eq!(flat(&result), Value::Array(expected));
            prop_assert_eq!(entities, before);
        }
    }
}
