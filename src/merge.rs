use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar, ResourceRequirements};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RESTART_ALWAYS: &str = "Always";

/// Configuration attached to one or more plugin tasks of a resource.
///
/// Fields this service does not interpret are carried through `extra`
/// untouched so re-encoding never drops data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOption {
    #[serde(default, rename = "for", skip_serializing_if = "Vec::is_empty")]
    pub for_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskOption {
    /// True when this option targets exactly the one task `name`.
    pub fn is_exclusively_for(&self, name: &str) -> bool {
        matches!(self.for_tasks.as_slice(), [only] if only == name)
    }
}

/// Merges `new` over `old`.
///
/// Env vars (by name) and env-from sources (by value) are replaced in place
/// and the remainder appended in `new`'s order. A key repeated in `new` is
/// placed once with its last value. Labels and annotations are
/// unioned with `new` winning. Restart policy, resources and script are taken
/// from `new` wholesale, even when unset there.
pub fn merge(old: &TaskOption, new: &TaskOption) -> TaskOption {
    let mut merged = old.clone();

    merged.env = merge_keyed(old.env.as_deref(), new.env.as_deref(), |a, b| a.name == b.name);
    merged.env_from = merge_keyed(old.env_from.as_deref(), new.env_from.as_deref(), |a, b| a == b);
    merged.labels = merge_maps(old.labels.as_ref(), new.labels.as_ref());
    merged.annotations = merge_maps(old.annotations.as_ref(), new.annotations.as_ref());

    merged.restart_policy = new.restart_policy.clone();
    merged.resources = new.resources.clone();
    merged.script = new.script.clone();

    merged
}

fn merge_keyed<T: Clone>(
    old: Option<&[T]>,
    new: Option<&[T]>,
    same: impl Fn(&T, &T) -> bool,
) -> Option<Vec<T>> {
    let Some(new) = new else {
        return old.map(<[T]>::to_vec);
    };

    // One entry per key: first position, last value.
    let mut incoming: Vec<T> = Vec::with_capacity(new.len());
    for entry in new {
        match incoming.iter().position(|seen| same(seen, entry)) {
            Some(i) => incoming[i] = entry.clone(),
            None => incoming.push(entry.clone()),
        }
    }

    let mut merged = old.map(<[T]>::to_vec).unwrap_or_default();
    let mut consumed = vec![false; incoming.len()];

    for entry in merged.iter_mut() {
        if let Some(i) = incoming.iter().position(|candidate| same(entry, candidate)) {
            *entry = incoming[i].clone();
            consumed[i] = true;
        }
    }
    merged.extend(
        incoming
            .into_iter()
            .zip(consumed)
            .filter(|(_, used)| !used)
            .map(|(entry, _)| entry),
    );

    Some(merged)
}

fn merge_maps(
    old: Option<&BTreeMap<String, String>>,
    new: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (old, new) {
        (None, None) => None,
        (old, new) => {
            let mut merged = old.cloned().unwrap_or_default();
            if let Some(new) = new {
                merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(merged)
        }
    }
}
