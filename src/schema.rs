//! Relation schemas.
//!
//! A schema is an ordered list of typed fields. It is immutable once the
//! catalog is built; every write and every trigger output is checked
//! against it before reaching the store.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entry::Fields;
use crate::error::ValidationError;
use crate::value::FieldType;

/// A single typed field in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Declared primitive type.
    pub field_type: FieldType,
    /// Whether the field may be absent or null.
    pub nullable: bool,
}

/// Ordered mapping from field name to primitive type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates an empty schema; add fields with [`Schema::field`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a required field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            nullable: false,
        });
        self
    }

    /// Appends a nullable field.
    #[must_use]
    pub fn nullable_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            field_type,
            nullable: true,
        });
        self
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks the schema itself: non-empty, valid and unique field names.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.fields.is_empty() {
            return Err(ValidationError::EmptySchema);
        }
        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            crate::registry::validate_name("field", &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(ValidationError::DuplicateField {
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validates entry fields for `relation` against this schema.
    ///
    /// Unknown fields are rejected. Absent and null values are accepted only
    /// for nullable fields.
    pub fn validate(&self, relation: &str, fields: &Fields) -> Result<(), ValidationError> {
        for name in fields.keys() {
            if self.get(name).is_none() {
                return Err(ValidationError::UnknownField {
                    relation: relation.to_string(),
                    field: name.clone(),
                });
            }
        }

        for field in &self.fields {
            match fields.get(&field.name) {
                None => {
                    if !field.nullable {
                        return Err(ValidationError::MissingField {
                            relation: relation.to_string(),
                            field: field.name.clone(),
                        });
                    }
                }
                Some(value) if value.is_null() => {
                    if !field.nullable {
                        return Err(ValidationError::MissingField {
                            relation: relation.to_string(),
                            field: field.name.clone(),
                        });
                    }
                }
                Some(value) => {
                    if !value.conforms_to(field.field_type) {
                        return Err(ValidationError::TypeMismatch {
                            relation: relation.to_string(),
                            field: field.name.clone(),
                            expected: field.field_type.name(),
                            actual: value.type_name(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}
