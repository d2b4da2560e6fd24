use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::merge::TaskOption;

const PLUGINS_FIELD: &str = "plugins";
const TASK_OPTIONS_FIELD: &str = "taskOptions";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("resource is not a JSON object")]
    NotAnObject,
    #[error("field '{field}' is not a JSON object")]
    FieldNotAnObject { field: &'static str },
    #[error("field '{field}' could not be decoded: {source}")]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("field '{field}' could not be encoded: {source}")]
    Encode {
        field: &'static str,
        source: serde_json::Error,
    },
}

/// The parts of a custom resource this service reads and rewrites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomResource {
    pub annotations: BTreeMap<String, String>,
    pub plugins: Map<String, Value>,
    pub task_options: Vec<TaskOption>,
}

/// Maps one served version of the resource to and from [`CustomResource`].
pub trait ResourceSchema: Send + Sync {
    fn api_version(&self) -> &str;

    fn decode(&self, object: &Value) -> Result<CustomResource, SchemaError>;

    /// Writes `resource` back into `object`, leaving unrelated fields alone.
    fn encode(&self, resource: &CustomResource, object: &mut Value) -> Result<(), SchemaError>;
}

/// Schema for versions that keep plugins at `spec.plugins` and task options
/// at `spec.taskOptions`.
pub struct SpecFieldSchema {
    version: String,
}

impl SpecFieldSchema {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl ResourceSchema for SpecFieldSchema {
    fn api_version(&self) -> &str {
        &self.version
    }

    fn decode(&self, object: &Value) -> Result<CustomResource, SchemaError> {
        let object = object.as_object().ok_or(SchemaError::NotAnObject)?;

        let annotations = match object.get("metadata").and_then(|m| m.get("annotations")) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|source| {
                SchemaError::InvalidField {
                    field: "metadata.annotations",
                    source,
                }
            })?,
        };

        let spec = match object.get("spec") {
            None | Some(Value::Null) => None,
            Some(Value::Object(spec)) => Some(spec),
            Some(_) => return Err(SchemaError::FieldNotAnObject { field: "spec" }),
        };

        let plugins = match spec.and_then(|s| s.get(PLUGINS_FIELD)) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(plugins)) => plugins.clone(),
            Some(_) => {
                return Err(SchemaError::FieldNotAnObject {
                    field: "spec.plugins",
                });
            }
        };

        let task_options = match spec.and_then(|s| s.get(TASK_OPTIONS_FIELD)) {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|source| {
                SchemaError::InvalidField {
                    field: "spec.taskOptions",
                    source,
                }
            })?,
        };

        Ok(CustomResource {
            annotations,
            plugins,
            task_options,
        })
    }

    fn encode(&self, resource: &CustomResource, object: &mut Value) -> Result<(), SchemaError> {
        let object = object.as_object_mut().ok_or(SchemaError::NotAnObject)?;

        let had_spec = object.get("spec").is_some_and(Value::is_object);
        let (had_plugins, previous_options) = match object.get("spec") {
            Some(Value::Object(spec)) => (
                spec.contains_key(PLUGINS_FIELD),
                spec.get(TASK_OPTIONS_FIELD).cloned(),
            ),
            _ => (false, None),
        };

        let write_plugins = had_plugins || !resource.plugins.is_empty();
        let write_options = previous_options.is_some() || !resource.task_options.is_empty();
        if !write_plugins && !write_options {
            return Ok(());
        }

        let task_options = if write_options {
            Some(encode_task_options(
                &resource.task_options,
                previous_options.as_ref().and_then(Value::as_array),
            )?)
        } else {
            None
        };

        if !had_spec {
            object.insert("spec".to_string(), Value::Object(Map::new()));
        }
        let Some(Value::Object(spec)) = object.get_mut("spec") else {
            return Err(SchemaError::FieldNotAnObject { field: "spec" });
        };

        if write_plugins {
            spec.insert(
                PLUGINS_FIELD.to_string(),
                Value::Object(resource.plugins.clone()),
            );
        }
        if let Some(task_options) = task_options {
            spec.insert(TASK_OPTIONS_FIELD.to_string(), task_options);
        }

        Ok(())
    }
}

/// Options that decode to the same value as the entry already at their index
/// keep their original JSON, so an untouched option never shows up in a diff.
fn encode_task_options(
    options: &[TaskOption],
    previous: Option<&Vec<Value>>,
) -> Result<Value, SchemaError> {
    options
        .iter()
        .enumerate()
        .map(|(i, option)| {
            let unchanged = previous
                .and_then(|p| p.get(i))
                .filter(|raw| {
                    serde_json::from_value::<TaskOption>((*raw).clone()).ok().as_ref()
                        == Some(option)
                });
            match unchanged {
                Some(raw) => Ok(raw.clone()),
                None => serde_json::to_value(option).map_err(|source| SchemaError::Encode {
                    field: "spec.taskOptions",
                    source,
                }),
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// Schemas keyed by the API version they serve.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn ResourceSchema>>,
}

impl SchemaRegistry {
    pub fn from_versions(versions: &[String]) -> Self {
        let mut registry = Self::default();
        for version in versions {
            registry.register(Arc::new(SpecFieldSchema::new(version.clone())));
        }
        registry
    }

    pub fn register(&mut self, schema: Arc<dyn ResourceSchema>) {
        self.schemas
            .insert(schema.api_version().to_string(), schema);
    }

    pub fn for_version(&self, version: &str) -> Option<&dyn ResourceSchema> {
        self.schemas.get(version).map(|s| s.as_ref())
    }
}
