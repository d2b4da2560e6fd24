use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PluginManagerConfig;
use crate::kube_api::ClusterApi;

const MUTATE_PATH: &str = "/mutate";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to look up mutating webhook configuration '{name}': {source}")]
    Lookup { name: String, source: kube::Error },
    #[error("failed to create mutating webhook configuration '{name}': {source}")]
    Create { name: String, source: kube::Error },
}

/// Where the webhook routes and what it matches.
#[derive(Debug, Clone)]
pub struct RegistrationTarget {
    pub configuration_name: String,
    pub webhook_name: String,
    pub service_namespace: String,
    pub service_name: String,
    pub service_port: i32,
    pub timeout_seconds: i32,
    pub api_group: String,
    pub api_versions: Vec<String>,
    pub resource: String,
}

impl RegistrationTarget {
    pub fn from_config(config: &PluginManagerConfig) -> Self {
        Self {
            configuration_name: config.webhook.configuration_name.clone(),
            webhook_name: config.webhook_entry_name(),
            service_namespace: config.namespace.clone(),
            service_name: config.webhook.service_name.clone(),
            service_port: config.webhook.service_port,
            timeout_seconds: config.webhook.timeout_seconds,
            api_group: config.resource.group.clone(),
            api_versions: config.resource.versions.clone(),
            resource: config.resource.resource.clone(),
        }
    }
}

/// Creates the mutating webhook registration once. An existing registration
/// is left alone, including its CA bundle.
pub struct WebhookRegistrar {
    api: Arc<dyn ClusterApi>,
    target: RegistrationTarget,
}

impl WebhookRegistrar {
    pub fn new(api: Arc<dyn ClusterApi>, target: RegistrationTarget) -> Self {
        Self { api, target }
    }

    /// Returns `true` when a registration was created by this call.
    pub async fn ensure_registered(&self, ca_bundle: &[u8]) -> Result<bool, RegistrationError> {
        let name = &self.target.configuration_name;
        let existing = self
            .api
            .get_mutating_webhook_configuration(name)
            .await
            .map_err(|source| RegistrationError::Lookup {
                name: name.clone(),
                source,
            })?;

        if existing.is_some() {
            debug!(configuration = %name, "mutating webhook configuration already exists");
            return Ok(false);
        }

        let configuration = build_configuration(&self.target, ca_bundle);
        self.api
            .create_mutating_webhook_configuration(&configuration)
            .await
            .map_err(|source| RegistrationError::Create {
                name: name.clone(),
                source,
            })?;

        info!(configuration = %name, "created mutating webhook configuration");
        Ok(true)
    }
}

pub fn build_configuration(
    target: &RegistrationTarget,
    ca_bundle: &[u8],
) -> MutatingWebhookConfiguration {
    let webhook = MutatingWebhook {
        name: target.webhook_name.clone(),
        admission_review_versions: vec!["v1".to_string()],
        client_config: WebhookClientConfig {
            ca_bundle: Some(ByteString(ca_bundle.to_vec())),
            service: Some(ServiceReference {
                namespace: target.service_namespace.clone(),
                name: target.service_name.clone(),
                path: Some(MUTATE_PATH.to_string()),
                port: Some(target.service_port),
            }),
            url: None,
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec![target.api_group.clone()]),
            api_versions: Some(target.api_versions.clone()),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(vec![target.resource.clone()]),
            scope: None,
        }]),
        failure_policy: Some("Fail".to_string()),
        side_effects: "None".to_string(),
        timeout_seconds: Some(target.timeout_seconds),
        ..Default::default()
    };

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(target.configuration_name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![webhook]),
    }
}
