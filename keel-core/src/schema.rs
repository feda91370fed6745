//! Schema - Attribute schemas published by Provider Adapters
//!
//! The Differ consults schemas to decide how collections compare, which
//! attributes are computed, and which changes force a replacement.

use std::collections::BTreeMap;
use std::fmt;

use crate::resource::{Attributes, Value};

/// Attribute type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Int,
    Bool,
    /// Enum (list of allowed values)
    Enum(Vec<String>),
    /// Ordered collection; compared element by element
    List(Box<AttributeType>),
    /// Unordered collection; compared by membership only
    Set(Box<AttributeType>),
    Map(Box<AttributeType>),
}

impl AttributeType {
    /// Check if a value conforms to this type
    pub fn validate(&self, value: &Value) -> Result<(), TypeError> {
        match (self, value) {
            // Not known until apply; checked by the provider then
            (_, Value::Unknown | Value::Ref(_)) => Ok(()),
            (_, Value::Null) => Ok(()),
            (AttributeType::String, Value::String(_)) => Ok(()),
            (AttributeType::Int, Value::Int(_)) => Ok(()),
            (AttributeType::Bool, Value::Bool(_)) => Ok(()),

            (AttributeType::Enum(variants), Value::String(s)) => {
                if variants.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(TypeError::InvalidEnumVariant {
                        value: s.clone(),
                        expected: variants.clone(),
                    })
                }
            }

            (AttributeType::List(inner) | AttributeType::Set(inner), Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.validate(item).map_err(|e| TypeError::ListItemError {
                        index: i,
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Map(inner), Value::Map(map)) => {
                for (k, v) in map {
                    inner.validate(v).map_err(|e| TypeError::MapValueError {
                        key: k.clone(),
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            _ => Err(TypeError::TypeMismatch {
                expected: self.type_name(),
                got: value_type_name(value),
            }),
        }
    }

    /// Compare two values according to this type's collection semantics
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (self, a, b) {
            (AttributeType::Set(inner), Value::List(xs), Value::List(ys)) => {
                xs.iter().all(|x| ys.iter().any(|y| inner.values_equal(x, y)))
                    && ys.iter().all(|y| xs.iter().any(|x| inner.values_equal(x, y)))
            }
            (AttributeType::List(inner), Value::List(xs), Value::List(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().zip(ys).all(|(x, y)| inner.values_equal(x, y))
            }
            (AttributeType::Map(inner), Value::Map(xs), Value::Map(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .all(|(k, x)| ys.get(k).is_some_and(|y| inner.values_equal(x, y)))
            }
            _ => a == b,
        }
    }

    fn type_name(&self) -> String {
        match self {
            AttributeType::String => "String".to_string(),
            AttributeType::Int => "Int".to_string(),
            AttributeType::Bool => "Bool".to_string(),
            AttributeType::Enum(variants) => format!("Enum({})", variants.join(" | ")),
            AttributeType::List(inner) => format!("List<{}>", inner.type_name()),
            AttributeType::Set(inner) => format!("Set<{}>", inner.type_name()),
            AttributeType::Map(inner) => format!("Map<{}>", inner.type_name()),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

fn value_type_name(value: &Value) -> String {
    match value {
        Value::Null => "Null",
        Value::Unknown => "Unknown",
        Value::Bool(_) => "Bool",
        Value::Int(_) => "Int",
        Value::String(_) => "String",
        Value::List(_) => "List",
        Value::Map(_) => "Map",
        Value::Ref(_) => "Ref",
    }
    .to_string()
}

/// Type error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid enum variant '{value}', expected one of: {}", expected.join(", "))]
    InvalidEnumVariant {
        value: String,
        expected: Vec<String>,
    },

    #[error("Required attribute '{name}' is missing")]
    MissingRequired { name: String },

    #[error("Attribute '{name}' is computed and cannot be set")]
    ComputedOnly { name: String },

    #[error("List item at index {index}: {inner}")]
    ListItemError { index: usize, inner: Box<TypeError> },

    #[error("Map value for key '{key}': {inner}")]
    MapValueError { key: String, inner: Box<TypeError> },
}

/// Attribute schema
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub attr_type: AttributeType,
    pub required: bool,
    /// Set by the provider; configuration may leave it out
    pub computed: bool,
    /// Only the provider may set it
    pub computed_only: bool,
    /// A change to this attribute cannot be applied in place
    pub forces_replacement: bool,
    pub description: Option<String>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            computed: false,
            computed_only: false,
            forces_replacement: false,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Optional attribute the provider fills in when left unset
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Attribute only the provider sets (e.g. `id`)
    pub fn computed_only(mut self) -> Self {
        self.computed = true;
        self.computed_only = true;
        self
    }

    pub fn forces_replacement(mut self) -> Self {
        self.forces_replacement = true;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

/// Resource schema
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub resource_type: String,
    /// Version recorded with every instance written under this schema
    pub version: u64,
    pub attributes: BTreeMap<String, AttributeSchema>,
    pub description: Option<String>,
}

impl ResourceSchema {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            version: 0,
            attributes: BTreeMap::new(),
            description: None,
        }
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.insert(schema.name.clone(), schema);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    pub fn is_computed(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| a.computed)
    }

    pub fn forces_replacement(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| a.forces_replacement)
    }

    /// Compare two values of `name`; attributes missing from the schema
    /// compare by plain equality
    pub fn values_equal(&self, name: &str, a: &Value, b: &Value) -> bool {
        match self.get(name) {
            Some(attr) => attr.attr_type.values_equal(a, b),
            None => a == b,
        }
    }

    /// Validate resource attributes
    pub fn validate(&self, attributes: &Attributes) -> Result<(), Vec<(String, TypeError)>> {
        let mut errors = Vec::new();

        for (name, schema) in &self.attributes {
            if schema.required && !attributes.contains_key(name) {
                errors.push((name.clone(), TypeError::MissingRequired { name: name.clone() }));
            }
        }

        for (name, value) in attributes {
            let Some(schema) = self.attributes.get(name) else {
                // Unknown attributes are allowed (for flexibility)
                continue;
            };
            if schema.computed_only {
                errors.push((name.clone(), TypeError::ComputedOnly { name: name.clone() }));
            } else if let Err(e) = schema.attr_type.validate(value) {
                errors.push((name.clone(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
