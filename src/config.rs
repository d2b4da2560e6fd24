use std::path::PathBuf;
use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    "tf-system".to_string()
}

fn default_secret_name() -> String {
    "terraform-operator-plugin-manager-certs".to_string()
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("/plugin/mutations")
}

fn default_ca_key_path() -> PathBuf {
    PathBuf::from("/etc/certs/ca.key")
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("/etc/certs/ca.crt")
}

fn default_tls_key_path() -> PathBuf {
    PathBuf::from("/etc/certs/tls.key")
}

fn default_tls_cert_path() -> PathBuf {
    PathBuf::from("/etc/certs/tls.crt")
}

fn default_webhook_name() -> String {
    "terraform-operator-plugin-manager".to_string()
}

fn default_webhook_domain() -> String {
    "galleybytes.com".to_string()
}

fn default_service_port() -> i32 {
    443
}

fn default_timeout_seconds() -> i32 {
    30
}

fn default_resource_group() -> String {
    "tf.isaaguilar.com".to_string()
}

fn default_resource_plural() -> String {
    "terraforms".to_string()
}

fn default_resource_versions() -> Vec<String> {
    vec!["v1alpha2".to_string()]
}

fn default_short_interval_secs() -> u64 {
    10
}

fn default_healthy_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_expiry_margin_days() -> i64 {
    30
}

fn default_ca_validity_days() -> i64 {
    3650
}

fn default_leaf_validity_days() -> i64 {
    365
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManagerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Namespace the service and its certificate secret live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    /// Directory holding one mutation policy document per plugin.
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,
    #[serde(default)]
    pub certs: CertPaths,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertPaths {
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: PathBuf,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: PathBuf,
}

impl Default for CertPaths {
    fn default() -> Self {
        Self {
            ca_key_path: default_ca_key_path(),
            ca_cert_path: default_ca_cert_path(),
            tls_key_path: default_tls_key_path(),
            tls_cert_path: default_tls_cert_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_name")]
    pub configuration_name: String,
    #[serde(default = "default_webhook_name")]
    pub service_name: String,
    #[serde(default = "default_service_port")]
    pub service_port: i32,
    /// Suffix that makes the webhook entry name fully qualified.
    #[serde(default = "default_webhook_domain")]
    pub domain: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            configuration_name: default_webhook_name(),
            service_name: default_webhook_name(),
            service_port: default_service_port(),
            domain: default_webhook_domain(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_resource_group")]
    pub group: String,
    #[serde(default = "default_resource_plural")]
    pub resource: String,
    #[serde(default = "default_resource_versions")]
    pub versions: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            group: default_resource_group(),
            resource: default_resource_plural(),
            versions: default_resource_versions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_short_interval_secs")]
    pub short_interval_secs: u64,
    #[serde(default = "default_healthy_interval_secs")]
    pub healthy_interval_secs: u64,
    /// A leaf that would fail verification this many days from now is rotated.
    #[serde(default = "default_expiry_margin_days")]
    pub expiry_margin_days: i64,
    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: i64,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            short_interval_secs: default_short_interval_secs(),
            healthy_interval_secs: default_healthy_interval_secs(),
            expiry_margin_days: default_expiry_margin_days(),
            ca_validity_days: default_ca_validity_days(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

impl LifecycleConfig {
    pub fn short_interval(&self) -> Duration {
        Duration::from_secs(self.short_interval_secs)
    }

    pub fn healthy_interval(&self) -> Duration {
        Duration::from_secs(self.healthy_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Deny instead of approving with a diagnostic when the inbound object
    /// cannot be decoded.
    #[serde(default)]
    pub deny_on_decode_error: bool,
}

impl PluginManagerConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PLUGIN_MANAGER_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Host names the serving certificate must cover, shortest first.
    pub fn dns_names(&self) -> Vec<String> {
        let svc = &self.webhook.service_name;
        let ns = &self.namespace;
        vec![
            svc.clone(),
            format!("{svc}.{ns}"),
            format!("{svc}.{ns}.svc"),
            format!("{svc}.{ns}.svc.cluster.local"),
        ]
    }

    pub fn webhook_entry_name(&self) -> String {
        format!("{}.{}", self.webhook.configuration_name, self.webhook.domain)
    }
}
