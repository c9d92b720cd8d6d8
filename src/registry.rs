//! Relation registry.
//!
//! Maps relation names to their definitions and to the triggers that
//! subscribe to them. Subscriber order is registration order, which is the
//! fan-out order when several triggers read the same relation.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, Fields, PartitionKey};
use crate::error::{RegistrationError, TributaryResult, ValidationError};
use crate::schema::Schema;

const NAME_PATTERN: &str = "^[A-Za-z_][A-Za-z0-9_]*$";

/// Prefix reserved for relations the pipeline creates itself.
pub const RESERVED_PREFIX: &str = "__";

static NAME_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Checks a relation, trigger or field name.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), ValidationError> {
    let valid = NAME_REGEX
        .get_or_init(|| Regex::new(NAME_PATTERN))
        .as_ref()
        .is_ok_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

pub(crate) fn check_not_reserved(name: &str) -> Result<(), RegistrationError> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(RegistrationError::ReservedName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A named, schema-typed, append-mostly table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Unique name.
    pub name: String,
    /// Field definitions.
    pub schema: Schema,
    /// Field whose value keys the relation: latest pointers, partitioned
    /// reads and the default partition of stateful triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
}

impl Relation {
    /// Unkeyed relation.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            key_field: None,
        }
    }

    /// Declares the key field.
    #[must_use]
    pub fn keyed_by(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    /// Validates entry fields against the schema.
    pub fn validate(&self, fields: &Fields) -> Result<(), ValidationError> {
        self.schema.validate(&self.name, fields)
    }

    /// Key of an entry written with `fields`, if the relation is keyed.
    #[must_use]
    pub fn key_for(&self, fields: &Fields) -> Option<PartitionKey> {
        let field = self.key_field.as_deref()?;
        match fields.get(field) {
            Some(v) if !v.is_null() => Some(PartitionKey::from_value(v)),
            _ => None,
        }
    }

    /// Key of a stored entry, if the relation is keyed.
    #[must_use]
    pub fn key_of(&self, entry: &Entry) -> Option<PartitionKey> {
        self.key_for(&entry.fields)
    }

    fn check(&self) -> TributaryResult<()> {
        validate_name("relation", &self.name)?;
        self.schema.check()?;
        if let Some(field) = &self.key_field {
            if self.schema.get(field).is_none() {
                return Err(RegistrationError::InvalidKeyField {
                    relation: self.name.clone(),
                    field: field.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Registry of relations and their subscribers.
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    relations: HashMap<String, Relation>,
    order: Vec<String>,
    subscribers: HashMap<String, Vec<String>>,
}

impl RelationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a relation.
    ///
    /// Returns `Ok(false)` when an identical relation is already registered.
    ///
    /// # Errors
    /// - `SchemaConflict` if the name is taken by a different definition
    /// - `ReservedName` for names beginning with `__`
    /// - validation errors for bad names, schemas or key fields
    pub fn register(&mut self, relation: Relation) -> TributaryResult<bool> {
        check_not_reserved(&relation.name)?;
        self.insert(relation)
    }

    /// Registers a pipeline-owned relation; reserved names are allowed.
    pub(crate) fn register_internal(&mut self, relation: Relation) -> TributaryResult<bool> {
        self.insert(relation)
    }

    fn insert(&mut self, relation: Relation) -> TributaryResult<bool> {
        relation.check()?;
        if let Some(existing) = self.relations.get(&relation.name) {
            if *existing == relation {
                tracing::warn!(relation = %relation.name, "relation already registered; ignoring");
                return Ok(false);
            }
            return Err(RegistrationError::SchemaConflict {
                relation: relation.name,
            }
            .into());
        }
        self.order.push(relation.name.clone());
        self.relations.insert(relation.name.clone(), relation);
        Ok(true)
    }

    /// Subscribes `trigger` to `relation`.
    pub fn subscribe(&mut self, relation: &str, trigger: &str) -> Result<(), RegistrationError> {
        if !self.relations.contains_key(relation) {
            return Err(RegistrationError::UnknownRelation {
                relation: relation.to_string(),
            });
        }
        let subs = self.subscribers.entry(relation.to_string()).or_default();
        if subs.iter().any(|t| t == trigger) {
            return Err(RegistrationError::DuplicateTrigger {
                trigger: trigger.to_string(),
            });
        }
        subs.push(trigger.to_string());
        Ok(())
    }

    /// Removes a subscription; returns whether it existed.
    pub fn unsubscribe(&mut self, relation: &str, trigger: &str) -> bool {
        let Some(subs) = self.subscribers.get_mut(relation) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|t| t != trigger);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.subscribers.remove(relation);
        }
        removed
    }

    /// Triggers subscribed to `relation`, in registration order.
    #[must_use]
    pub fn triggers_for(&self, relation: &str) -> &[String] {
        self.subscribers.get(relation).map_or(&[], Vec::as_slice)
    }

    /// Relation by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// True if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// Relations in registration order.
    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.order.iter().filter_map(|n| self.relations.get(n))
    }

    /// Number of relations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Removes a relation that no trigger subscribes to.
    pub fn remove(&mut self, name: &str) -> Result<Relation, RegistrationError> {
        if let Some(trigger) = self.triggers_for(name).first() {
            return Err(RegistrationError::RelationInUse {
                relation: name.to_string(),
                trigger: trigger.clone(),
            });
        }
        let relation = self
            .relations
            .remove(name)
            .ok_or_else(|| RegistrationError::UnknownRelation {
                relation: name.to_string(),
            })?;
        self.order.retain(|n| n != name);
        Ok(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TributaryError;
    use crate::value::FieldType;

    fn raw() -> Relation {
        Relation::new("raw", Schema::new().field("text", FieldType::String))
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("relation", "raw_events").is_ok());
        assert!(validate_name("relation", "_x1").is_ok());
        assert!(validate_name("relation", "1abc").is_err());
        assert!(validate_name("relation", "has space").is_err());
        assert!(validate_name("relation", "").is_err());
    }

    #[test]
    fn test_register_is_idempotent_for_identical_schema() {
        let mut registry = RelationRegistry::new();
        assert!(registry.register(raw()).unwrap());
        assert!(!registry.register(raw()).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_conflicting_schema_fails() {
        let mut registry = RelationRegistry::new();
        registry.register(raw()).unwrap();
        let other = Relation::new("raw", Schema::new().field("text", FieldType::Int));
        let err = registry.register(other).unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::SchemaConflict { relation }) if relation == "raw"
        ));

        let keyed = raw().keyed_by("text");
        assert!(registry.register(keyed).is_err());
    }

    #[test]
    fn test_register_rejects_bad_key_field_and_reserved_names() {
        let mut registry = RelationRegistry::new();
        let err = registry.register(raw().keyed_by("user")).unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::InvalidKeyField { .. })
        ));

        let reserved = Relation::new("__tick_x", Schema::new().field("fired_at", FieldType::Timestamp));
        assert!(registry.register(reserved.clone()).is_err());
        assert!(registry.register_internal(reserved).unwrap());
    }

    #[test]
    fn test_subscribe_unknown_relation_fails() {
        let mut registry = RelationRegistry::new();
        let err = registry.subscribe("raw", "wordCount").unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnknownRelation {
                relation: "raw".to_string()
            }
        );
    }

    #[test]
    fn test_triggers_for_keeps_registration_order() {
        let mut registry = RelationRegistry::new();
        registry.register(raw()).unwrap();
        registry.subscribe("raw", "b").unwrap();
        registry.subscribe("raw", "a").unwrap();
        registry.subscribe("raw", "c").unwrap();
        assert_eq!(registry.triggers_for("raw"), ["b", "a", "c"]);
        assert!(registry.triggers_for("other").is_empty());

        assert!(registry.unsubscribe("raw", "a"));
        assert!(!registry.unsubscribe("raw", "a"));
        assert_eq!(registry.triggers_for("raw"), ["b", "c"]);
    }

    #[test]
    fn test_remove_requires_no_subscribers() {
        let mut registry = RelationRegistry::new();
        registry.register(raw()).unwrap();
        registry.subscribe("raw", "t").unwrap();
        assert!(matches!(
            registry.remove("raw"),
            Err(RegistrationError::RelationInUse { .. })
        ));
        registry.unsubscribe("raw", "t");
        assert_eq!(registry.remove("raw").unwrap().name, "raw");
        assert!(!registry.contains("raw"));
        assert_eq!(registry.relations().count(), 0);
    }

    #[test]
    fn test_relation_key_for_fields() {
        let rel = Relation::new(
            "events",
            Schema::new()
                .field("user", FieldType::String)
                .nullable_field("n", FieldType::Int),
        )
        .keyed_by("user");
        let fields = crate::entry::fields([("user", "u1")]);
        assert_eq!(rel.key_for(&fields), Some(PartitionKey::new("u1")));
        assert_eq!(raw().key_for(&fields), None);
    }
}
