use std::path::PathBuf;

use json_patch::{Patch, PatchOperation};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::merge::{RESTART_ALWAYS, TaskOption, merge};
use crate::policy::{MutationPolicy, PolicyError, load_policies};
use crate::schema::{CustomResource, SchemaError, SchemaRegistry};

const STATUS_PATH: &str = "/status";

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("no schema is registered for version '{0}'")]
    UnsupportedVersion(String),
    #[error("failed to decode resource: {0}")]
    Decode(#[source] SchemaError),
    #[error("failed to encode mutated resource: {0}")]
    Encode(#[source] SchemaError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Result of running every policy against one resource.
#[derive(Debug)]
pub struct Mutation {
    pub patch: Patch,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct MutationEngine {
    schemas: SchemaRegistry,
    policy_dir: PathBuf,
}

impl MutationEngine {
    pub fn new(schemas: SchemaRegistry, policy_dir: PathBuf) -> Self {
        Self {
            schemas,
            policy_dir,
        }
    }

    /// Computes the patch that injects every policy's plugin and task option
    /// into `object`. Policies are re-read from disk on each call.
    pub async fn mutate(&self, version: &str, object: &Value) -> Result<Mutation, MutationError> {
        let schema = self
            .schemas
            .for_version(version)
            .ok_or_else(|| MutationError::UnsupportedVersion(version.to_string()))?;

        let mut resource = schema.decode(object).map_err(MutationError::Decode)?;
        let policies = load_policies(&self.policy_dir).await?;

        let (applied, skipped) = apply_policies(&mut resource, &policies);

        let mut mutated = object.clone();
        schema
            .encode(&resource, &mut mutated)
            .map_err(MutationError::Encode)?;

        Ok(Mutation {
            patch: compute_patch(object, &mutated),
            applied,
            skipped,
        })
    }
}

/// Applies `policies` in order, returning the task names that were applied and
/// those skipped by annotation.
pub fn apply_policies(
    resource: &mut CustomResource,
    policies: &[MutationPolicy],
) -> (Vec<String>, Vec<String>) {
    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    for policy in policies {
        if apply_policy(resource, policy) {
            applied.push(policy.task_name.clone());
        } else {
            skipped.push(policy.task_name.clone());
        }
    }
    (applied, skipped)
}

/// Returns `false` when the resource opted out of this policy.
pub fn apply_policy(resource: &mut CustomResource, policy: &MutationPolicy) -> bool {
    let task = &policy.task_name;

    if let Some(key) = &policy.skip_annotation {
        if resource.annotations.contains_key(key) {
            debug!(task = %task, annotation = %key, "resource opted out of plugin");
            return false;
        }
    }

    if let Some(previous) = resource
        .plugins
        .insert(task.clone(), policy.plugin_config.clone())
    {
        if previous != policy.plugin_config {
            info!(task = %task, "overwriting existing plugin configuration");
        }
    }

    let slot = resource
        .task_options
        .iter()
        .position(|option| option.is_exclusively_for(task));

    let mut option = match slot {
        Some(i) => merge(&resource.task_options[i], &policy.task_config),
        None => policy.task_config.clone(),
    };
    own_slot(&mut option, task);

    match slot {
        Some(i) => resource.task_options[i] = option,
        None => resource.task_options.push(option),
    }
    true
}

fn own_slot(option: &mut TaskOption, task: &str) {
    option.for_tasks = vec![task.to_string()];
    if option.restart_policy.as_deref().is_none_or(str::is_empty) {
        option.restart_policy = Some(RESTART_ALWAYS.to_string());
    }
}

/// Diffs two serialized resources, leaving out anything under `/status`.
pub fn compute_patch(before: &Value, after: &Value) -> Patch {
    let Patch(operations) = json_patch::diff(before, after);
    Patch(
        operations
            .into_iter()
            .filter(|op| !touches_status(op))
            .collect(),
    )
}

fn touches_status(op: &PatchOperation) -> bool {
    let path = match op {
        PatchOperation::Add(o) => o.path.as_str(),
        PatchOperation::Remove(o) => o.path.as_str(),
        PatchOperation::Replace(o) => o.path.as_str(),
        PatchOperation::Move(o) => o.path.as_str(),
        PatchOperation::Copy(o) => o.path.as_str(),
        PatchOperation::Test(o) => o.path.as_str(),
    };
    path == STATUS_PATH
        || path
            .strip_prefix(STATUS_PATH)
            .is_some_and(|rest| rest.starts_with('/'))
}
