//! Address - Unique identifiers for resource instances
//!
//! A resource address is `type.name`, optionally followed by an instance key:
//! `[0]` for instances expanded with `count`, `["blue"]` for `for_each`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key distinguishing the instances of an expanded resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceKey {
    /// Instance created by `count`
    Index(i64),
    /// Instance created by `for_each`
    Key(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Index(i) => write!(f, "[{}]", i),
            InstanceKey::Key(k) => {
                let quoted = serde_json::to_string(k).map_err(|_| fmt::Error)?;
                write!(f, "[{}]", quoted)
            }
        }
    }
}

/// Unique identifier for a resource instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceAddress {
    /// Resource type (e.g., "file_object", "aws_vpc")
    pub resource_type: String,
    /// Resource name as declared in configuration
    pub name: String,
    /// Instance key, if the declaration was expanded
    pub key: Option<InstanceKey>,
}

impl ResourceAddress {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            key: None,
        }
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.key = Some(InstanceKey::Index(index));
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(InstanceKey::Key(key.into()));
        self
    }

    /// The address of the resource this instance belongs to (key stripped)
    pub fn resource(&self) -> ResourceAddress {
        ResourceAddress::new(self.resource_type.clone(), self.name.clone())
    }

    /// Whether `self` names `other`.
    ///
    /// A keyless address names every instance of its resource.
    pub fn matches(&self, other: &ResourceAddress) -> bool {
        self.resource_type == other.resource_type
            && self.name == other.name
            && (self.key.is_none() || self.key == other.key)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

/// Error returned when an address string is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid resource address '{input}': {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: String,
}

impl AddressParseError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl FromStr for ResourceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, key) = match s.find('[') {
            Some(open) => {
                if !s.ends_with(']') {
                    return Err(AddressParseError::new(s, "unterminated instance key"));
                }
                let inner = &s[open + 1..s.len() - 1];
                (&s[..open], Some(parse_key(s, inner)?))
            }
            None => (s, None),
        };

        let (resource_type, name) = base
            .split_once('.')
            .ok_or_else(|| AddressParseError::new(s, "expected type.name"))?;

        if resource_type.is_empty() || name.is_empty() || name.contains('.') {
            return Err(AddressParseError::new(s, "expected type.name"));
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key,
        })
    }
}

fn parse_key(input: &str, inner: &str) -> Result<InstanceKey, AddressParseError> {
    if inner.starts_with('"') {
        serde_json::from_str::<String>(inner)
            .map(InstanceKey::Key)
            .map_err(|e| AddressParseError::new(input, format!("bad key: {}", e)))
    } else {
        inner
            .parse::<i64>()
            .map(InstanceKey::Index)
            .map_err(|_| AddressParseError::new(input, format!("bad index '{}'", inner)))
    }
}

impl Serialize for ResourceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
