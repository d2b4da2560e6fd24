use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tracing::info;

use crate::kube_api::ClusterApi;
use crate::pki::{CertificateAuthority, CertificateBundle, GenerationError};

pub const CA_KEY: &str = "ca.key";
pub const CA_CERT: &str = "ca.crt";
pub const TLS_KEY: &str = "tls.key";
pub const TLS_CERT: &str = "tls.crt";

const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("failed to read secret {namespace}/{name}: {source}")]
    Read {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[error("failed to write secret {namespace}/{name}: {source}")]
    Write {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[error("expected secret {namespace}/{name} to exist but it was not found")]
    Missing { namespace: String, name: String },
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// The single secret that holds the authoritative certificate bundle.
pub struct SecretStore {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    name: String,
}

impl SecretStore {
    pub fn new(api: Arc<dyn ClusterApi>, namespace: String, name: String) -> Self {
        Self {
            api,
            namespace,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stored bundle, issuing and storing a new one if the secret
    /// does not exist yet.
    pub async fn get_or_create(
        &self,
        authority: &CertificateAuthority,
        dns_names: &[String],
    ) -> Result<CertificateBundle, SecretStoreError> {
        if let Some(secret) = self.get().await? {
            return Ok(bundle_from_secret(&secret));
        }

        let bundle = authority.issue(dns_names)?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE_TLS.to_string()),
            data: Some(secret_data(&bundle)),
            ..Default::default()
        };

        let created = self
            .api
            .create_secret(&self.namespace, &secret)
            .await
            .map_err(|source| self.write_error(source))?;
        info!(
            secret = %self.name,
            namespace = %self.namespace,
            "created TLS certificates in secret"
        );

        Ok(bundle_from_secret(&created))
    }

    /// Overwrites the stored bundle.
    pub async fn update(&self, bundle: &CertificateBundle) -> Result<(), SecretStoreError> {
        let mut secret = self.get().await?.ok_or_else(|| SecretStoreError::Missing {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        })?;
        secret.data = Some(secret_data(bundle));

        self.api
            .replace_secret(&self.namespace, &self.name, &secret)
            .await
            .map_err(|source| self.write_error(source))?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Secret>, SecretStoreError> {
        self.api
            .get_secret(&self.namespace, &self.name)
            .await
            .map_err(|source| SecretStoreError::Read {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
                source,
            })
    }

    fn write_error(&self, source: kube::Error) -> SecretStoreError {
        SecretStoreError::Write {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            source,
        }
    }
}

fn secret_data(bundle: &CertificateBundle) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (CA_KEY.to_string(), ByteString(bundle.ca_key.clone())),
        (CA_CERT.to_string(), ByteString(bundle.ca_cert.clone())),
        (TLS_KEY.to_string(), ByteString(bundle.tls_key.clone())),
        (TLS_CERT.to_string(), ByteString(bundle.tls_cert.clone())),
    ])
}

/// Missing keys read as empty so they never match mounted material.
pub fn bundle_from_secret(secret: &Secret) -> CertificateBundle {
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| value.0.clone())
            .unwrap_or_default()
    };

    CertificateBundle {
        ca_key: field(CA_KEY),
        ca_cert: field(CA_CERT),
        tls_key: field(TLS_KEY),
        tls_cert: field(TLS_CERT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_api::MockClusterApi;
    use mockall::predicate::eq;

    fn stored_secret(bundle: &CertificateBundle) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("certs".to_string()),
                namespace: Some("tf-system".to_string()),
                ..Default::default()
            },
            data: Some(secret_data(bundle)),
            ..Default::default()
        }
    }

    fn sample_bundle() -> CertificateBundle {
        CertificateBundle {
            ca_key: b"ca-key".to_vec(),
            ca_cert: b"ca-cert".to_vec(),
            tls_key: b"tls-key".to_vec(),
            tls_cert: b"tls-cert".to_vec(),
        }
    }

    #[tokio::test]
    async fn existing_secret_is_returned_without_issuing() {
        let bundle = sample_bundle();
        let secret = stored_secret(&bundle);
        let mut api = MockClusterApi::new();
        api.expect_get_secret()
            .with(eq("tf-system"), eq("certs"))
            .times(1)
            .returning(move |_, _| Ok(Some(secret.clone())));
        api.expect_create_secret().never();

        let store = SecretStore::new(Arc::new(api), "tf-system".into(), "certs".into());
        let found = store
            .get_or_create(&CertificateAuthority::default(), &["pm".to_string()])
            .await
            .unwrap();

        assert_eq!(found, bundle);
    }

    #[tokio::test]
    async fn missing_secret_is_created_as_tls_secret() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret().returning(|_, _| Ok(None));
        api.expect_create_secret()
            .times(1)
            .withf(|ns, secret| {
                ns == "tf-system"
                    && secret.type_.as_deref() == Some("kubernetes.io/tls")
                    && secret.data.as_ref().is_some_and(|d| d.len() == 4)
            })
            .returning(|_, secret| Ok(secret.clone()));

        let store = SecretStore::new(Arc::new(api), "tf-system".into(), "certs".into());
        let bundle = store
            .get_or_create(&CertificateAuthority::default(), &["pm".to_string()])
            .await
            .unwrap();

        assert!(!bundle.ca_cert.is_empty());
        assert!(!bundle.tls_key.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_all_four_fields() {
        let old = sample_bundle();
        let secret = stored_secret(&old);
        let mut new = sample_bundle();
        new.tls_cert = b"rotated".to_vec();
        let expected = new.clone();

        let mut api = MockClusterApi::new();
        api.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        api.expect_replace_secret()
            .times(1)
            .withf(move |_, name, secret| {
                name == "certs" && bundle_from_secret(secret) == expected
            })
            .returning(|_, _, secret| Ok(secret.clone()));

        let store = SecretStore::new(Arc::new(api), "tf-system".into(), "certs".into());
        store.update(&new).await.unwrap();
    }

    #[tokio::test]
    async fn update_without_secret_fails() {
        let mut api = MockClusterApi::new();
        api.expect_get_secret().returning(|_, _| Ok(None));
        api.expect_replace_secret().never();

        let store = SecretStore::new(Arc::new(api), "tf-system".into(), "certs".into());
        let err = store.update(&sample_bundle()).await.unwrap_err();

        assert!(matches!(err, SecretStoreError::Missing { .. }));
    }

    #[test]
    fn missing_keys_read_as_empty() {
        let secret = Secret::default();
        assert_eq!(bundle_from_secret(&secret), CertificateBundle::default());
    }
}
