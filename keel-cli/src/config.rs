//! JSON configuration loader
//!
//! Expands `count` and `for_each` into instances and turns `${...}` strings
//! into references. The whole string must be a single reference: Keel has
//! no string interpolation of resource attributes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use keel_core::address::ResourceAddress;
use keel_core::resource::{Configuration, Lifecycle, Reference, ResourceDeclaration, Value};
use keel_state::BackendConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    backend: Option<BackendBlock>,
    #[serde(default)]
    resources: Vec<ResourceBlock>,
    #[serde(default)]
    outputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendBlock {
    #[serde(rename = "type")]
    backend_type: String,
    path: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceBlock {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    provider: Option<String>,
    count: Option<i64>,
    for_each: Option<serde_json::Value>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    lifecycle: Lifecycle,
    #[serde(default)]
    tainted: bool,
}

/// Configuration file contents
#[derive(Debug)]
pub struct LoadedConfig {
    pub configuration: Configuration,
    pub backend: BackendConfig,
}

/// Per-instance values substituted during expansion
#[derive(Debug, Clone)]
enum Expansion {
    Single,
    Count(i64),
    Each { key: String, value: serde_json::Value },
}

impl Expansion {
    fn address(&self, resource_type: &str, name: &str) -> ResourceAddress {
        let address = ResourceAddress::new(resource_type, name);
        match self {
            Expansion::Single => address,
            Expansion::Count(index) => address.with_index(*index),
            Expansion::Each { key, .. } => address.with_key(key.clone()),
        }
    }

    /// Value of a whole-string placeholder such as `${each.value}`
    fn lookup(&self, expr: &str) -> Option<Result<Value, String>> {
        match (self, expr) {
            (Expansion::Count(index), "count.index") => Some(Ok(Value::Int(*index))),
            (Expansion::Each { key, .. }, "each.key") => Some(Ok(Value::String(key.clone()))),
            (Expansion::Each { value, .. }, "each.value") => Some(Ok(Value::from_json(value))),
            (_, "count.index") => Some(Err("${count.index} used outside a counted resource".into())),
            (_, "each.key") | (_, "each.value") => {
                Some(Err(format!("${{{}}} used outside a for_each resource", expr)))
            }
            _ => None,
        }
    }

    /// Text of a placeholder embedded in a longer string
    fn substitute(&self, expr: &str) -> Option<Result<String, String>> {
        self.lookup(expr).map(|value| {
            value.and_then(|value| match value {
                Value::String(s) => Ok(s),
                Value::Int(i) => Ok(i.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(format!("${{{}}} is {} and cannot be embedded in a string", expr, other)),
            })
        })
    }
}

/// Read and expand a configuration file
pub fn load(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Parse and expand configuration JSON
pub fn parse(content: &str) -> Result<LoadedConfig, String> {
    let file: ConfigFile =
        serde_json::from_str(content).map_err(|e| format!("Parse error: {}", e))?;

    let mut resources = Vec::new();
    for block in &file.resources {
        for expansion in expansions(block)? {
            resources.push(declaration(block, &expansion)?);
        }
    }

    let mut configuration = Configuration::new(resources);
    for (name, json) in &file.outputs {
        let value = convert(json, &Expansion::Single)
            .map_err(|e| format!("output '{}': {}", name, e))?;
        configuration = configuration.with_output(name.clone(), value);
    }

    let backend = match file.backend {
        Some(block) => {
            let mut backend = BackendConfig::new(block.backend_type);
            if let Some(path) = block.path {
                backend = backend.with_attribute("path", Value::String(path));
            }
            if let Some(key) = block.key {
                backend = backend.with_attribute("key", Value::String(key));
            }
            backend
        }
        None => BackendConfig::default(),
    };

    Ok(LoadedConfig {
        configuration,
        backend,
    })
}

fn expansions(block: &ResourceBlock) -> Result<Vec<Expansion>, String> {
    let label = format!("{}.{}", block.resource_type, block.name);
    match (block.count, &block.for_each) {
        (Some(_), Some(_)) => Err(format!("{}: count and for_each are mutually exclusive", label)),
        (Some(count), None) if count < 0 => Err(format!("{}: count must not be negative", label)),
        (Some(count), None) => Ok((0..count).map(Expansion::Count).collect()),
        (None, Some(serde_json::Value::Array(items))) => {
            let mut expansions = Vec::new();
            for item in items {
                let serde_json::Value::String(key) = item else {
                    return Err(format!("{}: for_each lists must contain strings", label));
                };
                if expansions
                    .iter()
                    .any(|e| matches!(e, Expansion::Each { key: k, .. } if k == key))
                {
                    return Err(format!("{}: duplicate for_each key '{}'", label, key));
                }
                expansions.push(Expansion::Each {
                    key: key.clone(),
                    value: item.clone(),
                });
            }
            Ok(expansions)
        }
        (None, Some(serde_json::Value::Object(map))) => Ok(map
            .iter()
            .map(|(key, value)| Expansion::Each {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()),
        (None, Some(_)) => Err(format!("{}: for_each must be a list or an object", label)),
        (None, None) => Ok(vec![Expansion::Single]),
    }
}

fn declaration(block: &ResourceBlock, expansion: &Expansion) -> Result<ResourceDeclaration, String> {
    let address = expansion.address(&block.resource_type, &block.name);
    let mut decl = ResourceDeclaration::at(address.clone())
        .with_lifecycle(block.lifecycle.clone())
        .with_tainted(block.tainted);
    if let Some(provider) = &block.provider {
        decl = decl.with_provider(provider.clone());
    }

    for (name, json) in &block.attributes {
        let value = convert(json, expansion).map_err(|e| format!("{}.{}: {}", address, name, e))?;
        decl = decl.with_attribute(name.clone(), value);
    }
    for dependency in &block.depends_on {
        let dependency = dependency
            .parse()
            .map_err(|e| format!("{}: depends_on: {}", address, e))?;
        decl = decl.depends_on(dependency);
    }
    Ok(decl)
}

/// Convert JSON to a Value, resolving `${...}` placeholders
fn convert(json: &serde_json::Value, expansion: &Expansion) -> Result<Value, String> {
    match json {
        serde_json::Value::String(s) => convert_string(s, expansion),
        serde_json::Value::Array(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| convert(item, expansion))
                .collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(map) => Ok(Value::Map(
            map.iter()
                .map(|(k, v)| convert(v, expansion).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(Value::from_json(other)),
    }
}

fn convert_string(s: &str, expansion: &Expansion) -> Result<Value, String> {
    if let Some(expr) = whole_placeholder(s) {
        return match expansion.lookup(expr) {
            Some(value) => value,
            None => parse_reference(expr).map(Value::Ref),
        };
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in \"{}\"", s))?;
        let expr = &after[..end];
        match expansion.substitute(expr) {
            Some(text) => out.push_str(&text?),
            None => {
                return Err(format!(
                    "reference ${{{}}} must be the whole string value",
                    expr
                ));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// `expr` when `s` is exactly `${expr}`
fn whole_placeholder(s: &str) -> Option<&str> {
    let expr = s.strip_prefix("${")?.strip_suffix('}')?;
    (!expr.contains('}')).then_some(expr)
}

/// Parse `type.name.attr` or `type.name[key].attr`
fn parse_reference(expr: &str) -> Result<Reference, String> {
    let (address, attribute) = expr
        .rsplit_once('.')
        .filter(|(address, _)| address.contains('.'))
        .ok_or_else(|| format!("invalid reference ${{{}}}: expected type.name.attribute", expr))?;
    if attribute.is_empty() || attribute.contains(']') {
        return Err(format!(
            "invalid reference ${{{}}}: expected type.name.attribute",
            expr
        ));
    }
    let address: ResourceAddress = address
        .parse()
        .map_err(|e| format!("invalid reference ${{{}}}: {}", expr, e))?;
    Ok(Reference::new(address, attribute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn attribute<'a>(config: &'a LoadedConfig, address: &str, name: &str) -> &'a Value {
        let address = addr(address);
        config
            .configuration
            .resources
            .iter()
            .find(|r| r.address == address)
            .and_then(|r| r.attributes.get(name))
            .unwrap()
    }

    #[test]
    fn parses_resources_references_and_backend() {
        let config = parse(
            r#"{
                "backend": { "type": "local", "path": "state", "key": "prod" },
                "resources": [
                    { "type": "directory", "name": "site", "attributes": { "path": "out" } },
                    {
                        "type": "file",
                        "name": "index",
                        "attributes": {
                            "path": "out/index.html",
                            "content": "hello",
                            "directory": "${directory.site.id}",
                            "note": null
                        },
                        "depends_on": ["directory.site"],
                        "lifecycle": { "create_before_destroy": true, "ignore_changes": ["content"] }
                    }
                ],
                "outputs": { "site": "${directory.site.id}" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.configuration.resources.len(), 2);
        assert_eq!(
            attribute(&config, "file.index", "directory"),
            &Value::reference(addr("directory.site"), "id")
        );
        assert_eq!(attribute(&config, "file.index", "note"), &Value::Null);

        let index = &config.configuration.resources[1];
        assert_eq!(index.depends_on, vec![addr("directory.site")]);
        assert!(index.lifecycle.create_before_destroy);
        assert_eq!(index.lifecycle.ignore_changes, vec!["content".to_string()]);

        assert_eq!(config.backend.backend_type, "local");
        assert_eq!(config.backend.get_string("path"), Some("state"));
        assert_eq!(config.backend.state_key(), "prod");
        assert_eq!(
            config.configuration.outputs.get("site"),
            Some(&Value::reference(addr("directory.site"), "id"))
        );
    }

    #[test]
    fn count_expands_with_index() {
        let config = parse(
            r#"{ "resources": [
                { "type": "file", "name": "part", "count": 3,
                  "attributes": { "path": "part-${count.index}.txt", "index": "${count.index}" } },
                { "type": "file", "name": "first", "attributes": { "path": "${file.part[0].path}" } }
            ] }"#,
        )
        .unwrap();

        assert_eq!(config.configuration.resources.len(), 4);
        assert_eq!(
            attribute(&config, "file.part[2]", "path"),
            &Value::String("part-2.txt".to_string())
        );
        assert_eq!(attribute(&config, "file.part[1]", "index"), &Value::Int(1));
        assert_eq!(
            attribute(&config, "file.first", "path"),
            &Value::reference(addr("file.part").with_index(0), "path")
        );
    }

    #[test]
    fn for_each_expands_with_keys() {
        let config = parse(
            r#"{ "resources": [
                { "type": "file", "name": "env", "for_each": { "blue": 1, "green": 2 },
                  "attributes": { "path": "${each.key}.txt", "weight": "${each.value}" } },
                { "type": "file", "name": "tag", "for_each": ["a.b"],
                  "attributes": { "path": "${each.key}", "peer": "${file.env[\"blue\"].id}" } }
            ] }"#,
        )
        .unwrap();

        assert_eq!(
            attribute(&config, "file.env[\"green\"]", "path"),
            &Value::String("green.txt".to_string())
        );
        assert_eq!(attribute(&config, "file.env[\"blue\"]", "weight"), &Value::Int(1));
        assert_eq!(
            attribute(&config, "file.tag[\"a.b\"]", "peer"),
            &Value::reference(addr("file.env").with_key("blue"), "id")
        );
    }

    #[test]
    fn missing_backend_uses_local_default() {
        let config = parse(r#"{ "resources": [] }"#).unwrap();
        assert_eq!(config.backend.backend_type, "local");
        assert_eq!(config.backend.state_key(), "default");
        assert!(config.configuration.resources.is_empty());
    }

    #[test]
    fn rejects_invalid_configurations() {
        let cases = [
            (r#"{ "resorces": [] }"#, "unknown field"),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "count": 1, "for_each": ["x"] }] }"#,
                "mutually exclusive",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "count": -1 }] }"#,
                "negative",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "for_each": ["x", "x"] }] }"#,
                "duplicate",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "attributes": { "p": "${count.index}" } }] }"#,
                "outside a counted",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "attributes": { "p": "x-${file.b.id}" } }] }"#,
                "whole string",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "attributes": { "p": "${file.b}" } }] }"#,
                "expected type.name.attribute",
            ),
            (
                r#"{ "resources": [{ "type": "file", "name": "a", "depends_on": ["nope"] }] }"#,
                "depends_on",
            ),
        ];

        for (content, expected) in cases {
            let err = parse(content).unwrap_err();
            assert!(err.contains(expected), "{} should mention {:?}", err, expected);
        }
    }
}
