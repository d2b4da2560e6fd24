//! Certificate lifecycle: keeps the secret, the mounted files and the webhook
//! registration in agreement, and gates serving on a valid certificate.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{CertPaths, LifecycleConfig};
use crate::metrics::{CycleLabels, PluginManagerMetrics};
use crate::pki::{self, CertificateAuthority, CertificateBundle, GenerationError};
use crate::registrar::{RegistrationError, WebhookRegistrar};
use crate::secret_store::{SecretStore, SecretStoreError};
use crate::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    WaitingForMaterial,
    Validating,
    Healthy,
    Rotating,
    Drifted,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::WaitingForMaterial => "waiting_for_material",
            LifecycleState::Validating => "validating",
            LifecycleState::Healthy => "healthy",
            LifecycleState::Rotating => "rotating",
            LifecycleState::Drifted => "drifted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("failed to read mounted file '{}': {source}", .path.display())]
    MountRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Runs certificate checks on a state-dependent timer for the process lifetime.
pub struct CertLifecycleManager {
    store: SecretStore,
    registrar: WebhookRegistrar,
    authority: CertificateAuthority,
    paths: CertPaths,
    dns_names: Vec<String>,
    timing: LifecycleConfig,
    metrics: Arc<PluginManagerMetrics>,
    ready_tx: Option<oneshot::Sender<()>>,
    bundle_tx: watch::Sender<Option<CertificateBundle>>,
    state: LifecycleState,
}

impl CertLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SecretStore,
        registrar: WebhookRegistrar,
        authority: CertificateAuthority,
        paths: CertPaths,
        dns_names: Vec<String>,
        timing: LifecycleConfig,
        metrics: Arc<PluginManagerMetrics>,
        ready_tx: oneshot::Sender<()>,
        bundle_tx: watch::Sender<Option<CertificateBundle>>,
    ) -> Self {
        Self {
            store,
            registrar,
            authority,
            paths,
            dns_names,
            timing,
            metrics,
            ready_tx: Some(ready_tx),
            bundle_tx,
            state: LifecycleState::WaitingForMaterial,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether readiness has been signalled.
    pub fn started(&self) -> bool {
        self.ready_tx.is_none()
    }

    pub async fn run(mut self) {
        loop {
            let wait = self.tick().await;
            debug!(
                state = %self.state(),
                started = self.started(),
                next_check = ?wait,
                "certificate cycle finished"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Runs one cycle and returns how long to wait before the next one.
    pub async fn tick(&mut self) -> Duration {
        let state = match self.cycle().await {
            Ok(state) => state,
            Err(e) => {
                error!(secret = %self.store.name(), "certificate cycle failed: {e}");
                self.metrics.certificate_cycle_errors_total.inc();
                LifecycleState::Validating
            }
        };
        self.state = state;
        self.metrics
            .certificate_cycles_total
            .get_or_create(&CycleLabels {
                state: state.as_str(),
            })
            .inc();

        match state {
            LifecycleState::Healthy => self.timing.healthy_interval(),
            _ => self.timing.short_interval(),
        }
    }

    async fn cycle(&mut self) -> Result<LifecycleState, LifecycleError> {
        let stored = self
            .store
            .get_or_create(&self.authority, &self.dns_names)
            .await?;

        let Some(mounted) = self.read_mounted().await? else {
            info!("waiting for certificates to be mounted");
            return Ok(LifecycleState::WaitingForMaterial);
        };

        self.state = LifecycleState::Validating;
        if let Err(reason) = check_material(&mounted, &self.paths) {
            warn!("mounted certificate material is invalid: {reason}");
            return Ok(LifecycleState::Validating);
        }

        if mounted != stored {
            warn!(
                secret = %self.store.name(),
                "mounted certs do not match certs in secret; if this continues the pod may be misconfigured"
            );
            return Ok(LifecycleState::Drifted);
        }

        let primary = self.dns_names.first().ok_or(GenerationError::NoDnsNames)?;
        let check_at = time::OffsetDateTime::now_utc()
            + time::Duration::days(self.timing.expiry_margin_days);
        if let Some(reason) = self.rotation_reason(&mounted, primary, check_at) {
            info!(
                secret = %self.store.name(),
                "certificates are no longer valid ({reason}), updating secret with new certificates"
            );
            let renewed = self.renew(&mounted, check_at)?;
            self.store.update(&renewed).await?;
            self.metrics.certificate_rotations_total.inc();
            return Ok(LifecycleState::Rotating);
        }

        self.registrar.ensure_registered(&mounted.ca_cert).await?;

        info!(
            recheck_after = ?self.timing.healthy_interval(),
            "certificate validation passed"
        );
        self.bundle_tx.send_if_modified(|current| {
            if current.as_ref() == Some(&mounted) {
                return false;
            }
            *current = Some(mounted);
            true
        });
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
        }

        Ok(LifecycleState::Healthy)
    }

    /// Reissues the leaf under the mounted CA. A new CA is minted only when
    /// the current one is itself unusable at `check_at`.
    fn renew(
        &self,
        mounted: &CertificateBundle,
        check_at: time::OffsetDateTime,
    ) -> Result<CertificateBundle, GenerationError> {
        match pki::verify_ca(&mounted.ca_cert, check_at) {
            Ok(()) => self
                .authority
                .reissue_leaf(&mounted.ca_key, &mounted.ca_cert, &self.dns_names),
            Err(e) => {
                warn!("CA certificate is no longer usable ({e}), issuing a new CA");
                self.authority.issue(&self.dns_names)
            }
        }
    }

    /// Why the mounted leaf must be reissued, if it must.
    fn rotation_reason(
        &self,
        mounted: &CertificateBundle,
        primary: &str,
        check_at: time::OffsetDateTime,
    ) -> Option<String> {
        if let Err(e) = pki::verify_leaf(&mounted.ca_cert, &mounted.tls_cert, primary, check_at) {
            return Some(e.to_string());
        }
        let mut covered = match pki::subject_alt_dns_names(&mounted.tls_cert) {
            Ok(names) => names,
            Err(e) => return Some(e.to_string()),
        };
        let mut expected = self.dns_names.clone();
        covered.sort();
        expected.sort();
        (covered != expected).then(|| format!("certificate covers {covered:?}, expected {expected:?}"))
    }

    /// Returns `None` while any of the four files is missing or empty.
    async fn read_mounted(&self) -> Result<Option<CertificateBundle>, LifecycleError> {
        let paths = &self.paths;
        let (Some(ca_key), Some(ca_cert), Some(tls_key), Some(tls_cert)) = (
            read_non_empty(&paths.ca_key_path).await?,
            read_non_empty(&paths.ca_cert_path).await?,
            read_non_empty(&paths.tls_key_path).await?,
            read_non_empty(&paths.tls_cert_path).await?,
        ) else {
            return Ok(None);
        };

        Ok(Some(CertificateBundle {
            ca_key,
            ca_cert,
            tls_key,
            tls_cert,
        }))
    }
}

async fn read_non_empty(path: &Path) -> Result<Option<Vec<u8>>, LifecycleError> {
    match tokio::fs::read(path).await {
        Ok(data) if data.is_empty() => Ok(None),
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LifecycleError::MountRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn check_material(bundle: &CertificateBundle, paths: &CertPaths) -> Result<(), String> {
    let describe = |path: &Path, e: &dyn fmt::Display| format!("'{}': {e}", path.display());

    tls::check_private_key_pem(&bundle.ca_key).map_err(|e| describe(&paths.ca_key_path, &e))?;
    pki::check_certificate_pem(&bundle.ca_cert, "CA certificate")
        .map_err(|e| describe(&paths.ca_cert_path, &e))?;
    tls::check_private_key_pem(&bundle.tls_key).map_err(|e| describe(&paths.tls_key_path, &e))?;
    pki::check_certificate_pem(&bundle.tls_cert, "serving certificate")
        .map_err(|e| describe(&paths.tls_cert_path, &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
    use k8s_openapi::api::core::v1::Secret;
    use prometheus_client::registry::Registry;
    use tempfile::TempDir;

    use super::*;
    use crate::kube_api::ClusterApi;
    use crate::registrar::RegistrationTarget;
    use crate::secret_store::bundle_from_secret;

    #[derive(Default)]
    struct FakeCluster {
        secret: Mutex<Option<Secret>>,
        webhook: Mutex<Option<MutatingWebhookConfiguration>>,
        secret_writes: Mutex<usize>,
        webhook_creates: Mutex<usize>,
    }

    impl FakeCluster {
        fn stored(&self) -> Option<CertificateBundle> {
            self.secret.lock().unwrap().as_ref().map(bundle_from_secret)
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn get_secret(&self, _: &str, _: &str) -> Result<Option<Secret>, kube::Error> {
            Ok(self.secret.lock().unwrap().clone())
        }

        async fn create_secret(&self, _: &str, secret: &Secret) -> Result<Secret, kube::Error> {
            *self.secret.lock().unwrap() = Some(secret.clone());
            *self.secret_writes.lock().unwrap() += 1;
            Ok(secret.clone())
        }

        async fn replace_secret(
            &self,
            _: &str,
            _: &str,
            secret: &Secret,
        ) -> Result<Secret, kube::Error> {
            *self.secret.lock().unwrap() = Some(secret.clone());
            *self.secret_writes.lock().unwrap() += 1;
            Ok(secret.clone())
        }

        async fn get_mutating_webhook_configuration(
            &self,
            _: &str,
        ) -> Result<Option<MutatingWebhookConfiguration>, kube::Error> {
            Ok(self.webhook.lock().unwrap().clone())
        }

        async fn create_mutating_webhook_configuration(
            &self,
            configuration: &MutatingWebhookConfiguration,
        ) -> Result<MutatingWebhookConfiguration, kube::Error> {
            *self.webhook.lock().unwrap() = Some(configuration.clone());
            *self.webhook_creates.lock().unwrap() += 1;
            Ok(configuration.clone())
        }
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        manager: CertLifecycleManager,
        ready_rx: oneshot::Receiver<()>,
        bundle_rx: watch::Receiver<Option<CertificateBundle>>,
        paths: CertPaths,
        _dir: TempDir,
    }

    fn harness(authority: CertificateAuthority) -> Harness {
        let dir = TempDir::new().unwrap();
        let paths = CertPaths {
            ca_key_path: dir.path().join("ca.key"),
            ca_cert_path: dir.path().join("ca.crt"),
            tls_key_path: dir.path().join("tls.key"),
            tls_cert_path: dir.path().join("tls.crt"),
        };
        let config: crate::config::PluginManagerConfig =
            figment::Figment::new().extract().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let api: Arc<dyn ClusterApi> = cluster.clone();

        let store = SecretStore::new(api.clone(), "tf-system".into(), "certs".into());
        let registrar = WebhookRegistrar::new(api, RegistrationTarget::from_config(&config));
        let metrics = Arc::new(PluginManagerMetrics::new(&mut Registry::default()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (bundle_tx, bundle_rx) = watch::channel(None);

        let manager = CertLifecycleManager::new(
            store,
            registrar,
            authority,
            paths.clone(),
            config.dns_names(),
            config.lifecycle.clone(),
            metrics,
            ready_tx,
            bundle_tx,
        );

        Harness {
            cluster,
            manager,
            ready_rx,
            bundle_rx,
            paths,
            _dir: dir,
        }
    }

    fn mount(paths: &CertPaths, bundle: &CertificateBundle) {
        std::fs::write(&paths.ca_key_path, &bundle.ca_key).unwrap();
        std::fs::write(&paths.ca_cert_path, &bundle.ca_cert).unwrap();
        std::fs::write(&paths.tls_key_path, &bundle.tls_key).unwrap();
        std::fs::write(&paths.tls_cert_path, &bundle.tls_cert).unwrap();
    }

    #[tokio::test]
    async fn bootstrap_creates_secret_registers_once_and_signals_ready_once() {
        let mut h = harness(CertificateAuthority::default());

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::WaitingForMaterial);
        assert_eq!(wait, Duration::from_secs(10));
        let stored = h.cluster.stored().expect("secret created");
        assert_eq!(*h.cluster.webhook_creates.lock().unwrap(), 0);
        assert!(!h.manager.started());

        mount(&h.paths, &stored);
        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Healthy);
        assert_eq!(wait, Duration::from_secs(86400));
        assert!(h.manager.started());
        h.ready_rx.try_recv().expect("readiness signalled");
        assert_eq!(h.bundle_rx.borrow().as_ref(), Some(&stored));

        h.manager.tick().await;
        h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Healthy);
        assert_eq!(*h.cluster.webhook_creates.lock().unwrap(), 1);
        assert_eq!(*h.cluster.secret_writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn partially_mounted_material_keeps_waiting() {
        let mut h = harness(CertificateAuthority::default());
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();

        std::fs::write(&h.paths.ca_key_path, &stored.ca_key).unwrap();
        std::fs::write(&h.paths.ca_cert_path, &stored.ca_cert).unwrap();
        std::fs::write(&h.paths.tls_key_path, b"").unwrap();
        std::fs::write(&h.paths.tls_cert_path, &stored.tls_cert).unwrap();

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::WaitingForMaterial);
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn malformed_material_is_not_trusted() {
        let mut h = harness(CertificateAuthority::default());
        h.manager.tick().await;
        let mut stored = h.cluster.stored().unwrap();
        stored.tls_cert = b"garbage".to_vec();
        mount(&h.paths, &stored);

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Validating);
        assert_eq!(wait, Duration::from_secs(10));
        assert!(!h.manager.started());
    }

    #[tokio::test]
    async fn drifted_material_is_left_alone() {
        let mut h = harness(CertificateAuthority::default());
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();
        let other = CertificateAuthority::default()
            .issue(&["pm".to_string()])
            .unwrap();
        let mut mounted = stored.clone();
        mounted.tls_cert = other.tls_cert;
        mount(&h.paths, &mounted);

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Drifted);
        assert_eq!(wait, Duration::from_secs(10));
        assert_eq!(h.cluster.stored(), Some(stored));
        assert_eq!(*h.cluster.secret_writes.lock().unwrap(), 1);
        assert_eq!(*h.cluster.webhook_creates.lock().unwrap(), 0);
        assert!(!h.manager.started());
    }

    #[tokio::test]
    async fn expiring_certificate_is_rotated() {
        let short_lived = CertificateAuthority::new(time::Duration::days(3650), time::Duration::days(5));
        let mut h = harness(short_lived);
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();
        mount(&h.paths, &stored);

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Rotating);
        assert_eq!(wait, Duration::from_secs(10));
        let rotated = h.cluster.stored().unwrap();
        assert_ne!(rotated, stored);
        assert_eq!(*h.cluster.webhook_creates.lock().unwrap(), 0);
        assert!(!h.manager.started());
    }

    #[tokio::test]
    async fn rotated_leaf_still_verifies_against_registered_ca() {
        let short_lived =
            CertificateAuthority::new(time::Duration::days(3650), time::Duration::days(40));
        let mut h = harness(short_lived);
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();
        mount(&h.paths, &stored);
        h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Healthy);
        let registered_ca = h
            .cluster
            .webhook
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.webhooks.as_ref())
            .and_then(|w| w[0].client_config.ca_bundle.clone())
            .expect("CA bundle registered")
            .0;

        // Let the leaf fall inside the expiry margin.
        h.manager.timing.expiry_margin_days = 45;
        h.manager.tick().await;

        assert_eq!(h.manager.state(), LifecycleState::Rotating);
        let rotated = h.cluster.stored().unwrap();
        assert_eq!(rotated.ca_cert, stored.ca_cert);
        assert_eq!(rotated.ca_key, stored.ca_key);
        assert_ne!(rotated.tls_cert, stored.tls_cert);
        pki::verify_leaf(
            &registered_ca,
            &rotated.tls_cert,
            &h.manager.dns_names[0],
            time::OffsetDateTime::now_utc() + time::Duration::days(30),
        )
        .unwrap();

        h.manager.timing.expiry_margin_days = 30;
        mount(&h.paths, &rotated);
        h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Healthy);
        assert_eq!(h.bundle_rx.borrow().as_ref(), Some(&rotated));
        assert_eq!(*h.cluster.webhook_creates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn expiring_ca_is_replaced() {
        let short_ca = CertificateAuthority::new(time::Duration::days(5), time::Duration::days(5));
        let mut h = harness(short_ca);
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();
        mount(&h.paths, &stored);

        h.manager.tick().await;

        assert_eq!(h.manager.state(), LifecycleState::Rotating);
        let rotated = h.cluster.stored().unwrap();
        assert_ne!(rotated.ca_cert, stored.ca_cert);
    }

    #[tokio::test]
    async fn failed_cycle_retries_on_short_interval() {
        let mut h = harness(CertificateAuthority::default());
        h.manager.tick().await;
        let stored = h.cluster.stored().unwrap();
        mount(&h.paths, &stored);
        assert_eq!(h.manager.tick().await, Duration::from_secs(86400));

        std::fs::remove_file(&h.paths.tls_cert_path).unwrap();
        std::fs::create_dir(&h.paths.tls_cert_path).unwrap();

        let wait = h.manager.tick().await;
        assert_eq!(h.manager.state(), LifecycleState::Validating);
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn certificate_missing_an_alias_is_rotated() {
        let mut h = harness(CertificateAuthority::default());
        let config: crate::config::PluginManagerConfig =
            figment::Figment::new().extract().unwrap();
        let primary_only = CertificateAuthority::default()
            .issue(&config.dns_names()[..1])
            .unwrap();
        let secret = Secret {
            data: Some(
                [
                    ("ca.key", &primary_only.ca_key),
                    ("ca.crt", &primary_only.ca_cert),
                    ("tls.key", &primary_only.tls_key),
                    ("tls.crt", &primary_only.tls_cert),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), k8s_openapi::ByteString(v.clone())))
                .collect(),
            ),
            ..Default::default()
        };
        *h.cluster.secret.lock().unwrap() = Some(secret);
        mount(&h.paths, &primary_only);

        h.manager.tick().await;

        assert_eq!(h.manager.state(), LifecycleState::Rotating);
        let rotated = h.cluster.stored().unwrap();
        assert_eq!(
            pki::subject_alt_dns_names(&rotated.tls_cert).unwrap(),
            config.dns_names()
        );
    }
}
