use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::merge::TaskOption;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy path '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse policy file '{}': {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyFormat {
    Json,
    Yaml,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    #[serde(default)]
    skip_annotation: Option<String>,
    #[serde(default)]
    plugin_config: Value,
    #[serde(default)]
    task_config: TaskOption,
}

/// One plugin's injection rule, named after the file it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationPolicy {
    pub task_name: String,
    /// Resources annotated with this key are left alone by this policy.
    pub skip_annotation: Option<String>,
    pub plugin_config: Value,
    pub task_config: TaskOption,
}

impl MutationPolicy {
    fn from_document(task_name: String, doc: PolicyDocument) -> Self {
        let plugin_config = match doc.plugin_config {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            task_name,
            skip_annotation: doc.skip_annotation.filter(|key| !key.is_empty()),
            plugin_config,
            task_config: doc.task_config,
        }
    }
}

/// Splits a policy file name into its task name and format.
fn classify(file_name: &str) -> Option<(&str, PolicyFormat)> {
    if file_name.starts_with('.') {
        return None;
    }
    let (task, format) = if let Some(task) = file_name.strip_suffix(".json") {
        (task, PolicyFormat::Json)
    } else if let Some(task) = file_name.strip_suffix(".yaml") {
        (task, PolicyFormat::Yaml)
    } else if let Some(task) = file_name.strip_suffix(".yml") {
        (task, PolicyFormat::Yaml)
    } else {
        return None;
    };
    (!task.is_empty()).then_some((task, format))
}

fn parse(path: &Path, format: PolicyFormat, raw: &[u8]) -> Result<PolicyDocument, PolicyError> {
    let parsed = match format {
        PolicyFormat::Json => serde_json::from_slice(raw).map_err(|e| e.to_string()),
        PolicyFormat::Yaml => serde_yaml::from_slice(raw).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| PolicyError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

fn read_error(path: &Path) -> impl FnOnce(std::io::Error) -> PolicyError {
    let path = path.to_path_buf();
    move |source| PolicyError::Read { path, source }
}

/// Reads every policy in `dir`, ordered by file name.
///
/// The directory is read on each call so policy changes apply to the next
/// request. Sub-directories, dot-prefixed entries and files without a
/// `.json`, `.yaml` or `.yml` suffix are ignored. Entries are stat'ed through
/// symlinks because mounted ConfigMaps expose files as links.
pub async fn load_policies(dir: &Path) -> Result<Vec<MutationPolicy>, PolicyError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error(dir))?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_error(dir))? {
        let Ok(file_name) = entry.file_name().into_string() else {
            debug!(dir = %dir.display(), "skipping policy entry with non UTF-8 name");
            continue;
        };
        candidates.push((file_name, entry.path()));
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut policies = Vec::new();
    for (file_name, path) in candidates {
        let Some((task_name, format)) = classify(&file_name) else {
            debug!(file = %file_name, "skipping non-policy entry");
            continue;
        };
        let metadata = tokio::fs::metadata(&path).await.map_err(read_error(&path))?;
        if metadata.is_dir() {
            debug!(file = %file_name, "skipping policy directory entry");
            continue;
        }

        let raw = tokio::fs::read(&path).await.map_err(read_error(&path))?;
        let doc = parse(&path, format, &raw)?;
        policies.push(MutationPolicy::from_document(task_name.to_string(), doc));
    }

    Ok(policies)
}
