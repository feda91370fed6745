//! Resource - Declared resources and their attribute values

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::address::{AddressParseError, ResourceAddress};

/// Attribute map of a resource, ordered by attribute name
pub type Attributes = BTreeMap<String, Value>;

/// Reference to another resource instance's attribute (`type.name.attribute`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub address: ResourceAddress,
    pub attribute: String,
}

impl Reference {
    pub fn new(address: ResourceAddress, attribute: impl Into<String>) -> Self {
        Self {
            address,
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

impl FromStr for Reference {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, attribute) = s.rsplit_once('.').ok_or_else(|| AddressParseError {
            input: s.to_string(),
            reason: "expected type.name.attribute".to_string(),
        })?;
        if attribute.is_empty() || attribute.ends_with(']') {
            return Err(AddressParseError {
                input: s.to_string(),
                reason: "missing attribute name".to_string(),
            });
        }
        Ok(Self {
            address: address.parse()?,
            attribute: attribute.to_string(),
        })
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Attribute value of a resource
///
/// `Null` is an explicit value: an attribute set to `Null` is not the same
/// as an attribute missing from the map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    /// Computed value that is only known once the resource has been applied
    Unknown,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to another instance's attribute, resolved at execution time
    Ref(Reference),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn reference(address: ResourceAddress, attribute: impl Into<String>) -> Self {
        Value::Ref(Reference::new(address, attribute))
    }

    /// Returns true if no part of this value is `Unknown` or an unresolved reference
    pub fn is_known(&self) -> bool {
        match self {
            Value::Unknown | Value::Ref(_) => false,
            Value::List(items) => items.iter().all(Value::is_known),
            Value::Map(map) => map.values().all(Value::is_known),
            _ => true,
        }
    }

    /// Collect every reference contained in this value
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Reference>) {
        match self {
            Value::Ref(r) => refs.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(refs)),
            Value::Map(map) => map.values().for_each(|v| v.collect_references(refs)),
            _ => {}
        }
    }

    /// Replace references using `lookup`.
    ///
    /// References `lookup` cannot answer are kept as-is.
    pub fn resolve(&self, lookup: &dyn Fn(&Reference) -> Option<Value>) -> Value {
        match self {
            Value::Ref(r) => lookup(r).unwrap_or_else(|| self.clone()),
            Value::List(items) => Value::List(items.iter().map(|v| v.resolve(lookup)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
            _ => self.clone(),
        }
    }

    /// Convert from a plain JSON value
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::String(n.to_string()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a plain JSON value.
    ///
    /// Returns `None` if the value is not fully known.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<_>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect::<Option<_>>()?,
            ),
            Value::Unknown | Value::Ref(_) => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Unknown => write!(f, "(known after apply)"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                let strs: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", strs.join(", "))
            }
            Value::Map(map) => {
                let strs: Vec<String> = map.iter().map(|(k, v)| format!("{} = {}", k, v)).collect();
                write!(f, "{{{}}}", strs.join(", "))
            }
            Value::Ref(r) => write!(f, "${{{}}}", r),
        }
    }
}

/// Lifecycle flags of a declared resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lifecycle {
    /// Refuse any plan that would delete or replace this resource
    pub prevent_destroy: bool,
    /// Create the replacement before deleting the old object
    pub create_before_destroy: bool,
    /// Attributes whose differences are ignored
    pub ignore_changes: Vec<String>,
}

/// Desired state of one resource instance, as declared in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub address: ResourceAddress,
    /// Name of the provider managing this resource
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    /// Explicit dependencies in addition to those implied by references
    #[serde(default)]
    pub depends_on: Vec<ResourceAddress>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Force replacement on the next apply
    #[serde(default)]
    pub tainted: bool,
}

impl ResourceDeclaration {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::at(ResourceAddress::new(resource_type, name))
    }

    pub fn at(address: ResourceAddress) -> Self {
        Self {
            address,
            provider: None,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
            tainted: false,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn depends_on(mut self, address: ResourceAddress) -> Self {
        self.depends_on.push(address);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }

    /// References contained in the attribute expressions
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes.values().flat_map(|v| v.references()).collect()
    }
}

/// Everything the configuration loader hands to the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Output name -> expression
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl Configuration {
    pub fn new(resources: Vec<ResourceDeclaration>) -> Self {
        Self {
            resources,
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(name.into(), value);
        self
    }
}
