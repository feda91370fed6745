//! File-backed demonstration provider
//!
//! Manages `file` and `directory` objects on the local filesystem. Relative
//! paths are resolved against the directory of the configuration file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use keel_core::provider::{
    BoxFuture, OperationContext, ProviderAdapter, ProviderError, ProviderResult, ReadOutcome,
};
use keel_core::resource::{Attributes, Value};
use keel_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn path_of(&self, attributes: &Attributes) -> ProviderResult<(String, PathBuf)> {
        match attributes.get("path") {
            Some(Value::String(path)) => Ok((path.clone(), self.resolve(path))),
            _ => Err(ProviderError::new("'path' must be a known string")),
        }
    }

    fn content_of(attributes: &Attributes) -> ProviderResult<String> {
        match attributes.get("content") {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(content)) => Ok(content.clone()),
            Some(other) => Err(ProviderError::new(format!(
                "'content' must be a string, got {}",
                other
            ))),
        }
    }

    fn write_file(&self, config: &Attributes) -> ProviderResult<Attributes> {
        let (path, full) = self.path_of(config)?;
        let content = Self::content_of(config)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create directory for", &full, e))?;
        }
        fs::write(&full, &content).map_err(|e| io_error("write", &full, e))?;

        let mut attributes = config.clone();
        attributes.insert("id".to_string(), Value::String(path));
        attributes.insert("size".to_string(), Value::Int(content.len() as i64));
        Ok(attributes)
    }

    fn read_file(&self, prior: &Attributes) -> ProviderResult<ReadOutcome> {
        let (_, full) = self.path_of(prior)?;
        let content = match fs::read_to_string(&full) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReadOutcome::NotFound),
            Err(e) => return Err(io_error("read", &full, e)),
        };

        let mut attributes = prior.clone();
        attributes.insert("size".to_string(), Value::Int(content.len() as i64));
        attributes.insert("content".to_string(), Value::String(content));
        Ok(ReadOutcome::Found(attributes))
    }

    fn create_directory(&self, config: &Attributes) -> ProviderResult<Attributes> {
        let (path, full) = self.path_of(config)?;
        fs::create_dir_all(&full).map_err(|e| io_error("create", &full, e))?;

        let mut attributes = config.clone();
        attributes.insert("id".to_string(), Value::String(path));
        Ok(attributes)
    }

    fn read_directory(&self, prior: &Attributes) -> ProviderResult<ReadOutcome> {
        let (_, full) = self.path_of(prior)?;
        if full.is_dir() {
            Ok(ReadOutcome::Found(prior.clone()))
        } else {
            Ok(ReadOutcome::NotFound)
        }
    }

    fn remove(&self, resource_type: &str, prior: &Attributes) -> ProviderResult<()> {
        let (_, full) = self.path_of(prior)?;
        let result = if resource_type == "directory" {
            fs::remove_dir(&full)
        } else {
            fs::remove_file(&full)
        };
        match result {
            Ok(()) => Ok(()),
            // Already gone
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &full, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> ProviderError {
    let message = format!("Failed to {} {}: {}", action, path.display(), e);
    let error = match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            ProviderError::transient(message)
        }
        _ => ProviderError::new(message),
    };
    error.with_cause(e)
}

fn unsupported(resource_type: &str) -> ProviderError {
    ProviderError::new(format!("Unsupported resource type: {}", resource_type))
}

impl ProviderAdapter for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn resource_types(&self) -> Vec<String> {
        vec!["file".to_string(), "directory".to_string()]
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        match resource_type {
            "file" => Some(
                ResourceSchema::new("file")
                    .with_description("A file on the local filesystem")
                    .attribute(
                        AttributeSchema::new("path", AttributeType::String)
                            .required()
                            .forces_replacement(),
                    )
                    .attribute(AttributeSchema::new("content", AttributeType::String))
                    .attribute(AttributeSchema::new("id", AttributeType::String).computed_only())
                    .attribute(AttributeSchema::new("size", AttributeType::Int).computed_only()),
            ),
            "directory" => Some(
                ResourceSchema::new("directory")
                    .with_description("A directory on the local filesystem")
                    .attribute(
                        AttributeSchema::new("path", AttributeType::String)
                            .required()
                            .forces_replacement(),
                    )
                    .attribute(AttributeSchema::new("id", AttributeType::String).computed_only()),
            ),
            _ => None,
        }
    }

    fn create(
        &self,
        ctx: &OperationContext,
        config: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>> {
        let resource_type = ctx.address.resource_type.clone();
        let config = config.clone();
        Box::pin(async move {
            match resource_type.as_str() {
                "file" => self.write_file(&config),
                "directory" => self.create_directory(&config),
                other => Err(unsupported(other)),
            }
        })
    }

    fn read(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<ReadOutcome>> {
        let resource_type = ctx.address.resource_type.clone();
        let prior = prior.clone();
        Box::pin(async move {
            match resource_type.as_str() {
                "file" => self.read_file(&prior),
                "directory" => self.read_directory(&prior),
                other => Err(unsupported(other)),
            }
        })
    }

    fn update(
        &self,
        ctx: &OperationContext,
        _prior: &Attributes,
        desired: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>> {
        let resource_type = ctx.address.resource_type.clone();
        let desired = desired.clone();
        Box::pin(async move {
            match resource_type.as_str() {
                "file" => self.write_file(&desired),
                "directory" => self.create_directory(&desired),
                other => Err(unsupported(other)),
            }
        })
    }

    fn delete(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let resource_type = ctx.address.resource_type.clone();
        let prior = prior.clone();
        Box::pin(async move { self.remove(&resource_type, &prior) })
    }
}
