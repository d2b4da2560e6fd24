//! Self-signed CA issuance and serving-certificate verification.
//!
//! A fresh bundle carries a new CA. Rotation reissues only the leaf against
//! the existing CA so the registered CA bundle keeps verifying it.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::{Pem, parse_x509_pem};

const ORGANIZATION: &str = "terraform-operator-plugin-manager";

/// PEM material for the CA and the serving leaf it signed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca_key: Vec<u8>,
    pub ca_cert: Vec<u8>,
    pub tls_key: Vec<u8>,
    pub tls_cert: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no DNS names given for the serving certificate")]
    NoDnsNames,
    #[error("failed to generate {what} key: {source}")]
    KeyGeneration {
        what: &'static str,
        source: rcgen::Error,
    },
    #[error("failed to sign {what} certificate: {source}")]
    Signing {
        what: &'static str,
        source: rcgen::Error,
    },
    #[error("failed to load existing CA: {0}")]
    LoadCa(String),
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("{what} is not valid PEM: {reason}")]
    Pem { what: &'static str, reason: String },
    #[error("{what} is not a valid X.509 certificate: {reason}")]
    Parse { what: &'static str, reason: String },
    #[error("CA certificate is not a certificate authority")]
    NotCa,
    #[error("serving certificate signature does not verify against the CA: {0}")]
    Signature(String),
    #[error("{what} is not valid at {at}")]
    OutsideValidity {
        what: &'static str,
        at: OffsetDateTime,
    },
    #[error("serving certificate does not cover DNS name '{0}'")]
    DnsNameMismatch(String),
    #[error("serving certificate is not usable for server authentication")]
    NotServerAuth,
}

/// Issues a CA and a CA-signed serving certificate.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    ca_validity: Duration,
    leaf_validity: Duration,
}

impl Default for CertificateAuthority {
    fn default() -> Self {
        Self::new(Duration::days(3650), Duration::days(365))
    }
}

impl CertificateAuthority {
    pub fn new(ca_validity: Duration, leaf_validity: Duration) -> Self {
        Self {
            ca_validity,
            leaf_validity,
        }
    }

    /// Generates a new bundle whose leaf carries exactly `dns_names` as SANs.
    pub fn issue(&self, dns_names: &[String]) -> Result<CertificateBundle, GenerationError> {
        let common_name = dns_names.first().ok_or(GenerationError::NoDnsNames)?;
        let now = OffsetDateTime::now_utc();

        let ca_key = KeyPair::generate().map_err(|source| GenerationError::KeyGeneration {
            what: "CA",
            source,
        })?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name(&format!("{common_name}-ca"));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = now - Duration::hours(1);
        ca_params.not_after = now + self.ca_validity;

        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|source| GenerationError::Signing { what: "CA", source })?;
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
            .map_err(|source| GenerationError::Signing { what: "CA", source })?;
        let (tls_key, tls_cert) = self.sign_leaf(dns_names, &issuer, now)?;

        Ok(CertificateBundle {
            ca_key: ca_key_pem.into_bytes(),
            ca_cert: ca_cert_pem.into_bytes(),
            tls_key,
            tls_cert,
        })
    }

    /// Issues a new serving leaf signed by an existing CA. The returned bundle
    /// carries the given CA material unchanged.
    pub fn reissue_leaf(
        &self,
        ca_key_pem: &[u8],
        ca_cert_pem: &[u8],
        dns_names: &[String],
    ) -> Result<CertificateBundle, GenerationError> {
        let key_pem = std::str::from_utf8(ca_key_pem)
            .map_err(|e| GenerationError::LoadCa(format!("CA key is not UTF-8: {e}")))?;
        let cert_pem = std::str::from_utf8(ca_cert_pem)
            .map_err(|e| GenerationError::LoadCa(format!("CA certificate is not UTF-8: {e}")))?;

        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| GenerationError::LoadCa(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, &ca_key)
            .map_err(|e| GenerationError::LoadCa(format!("failed to create issuer: {e}")))?;
        let (tls_key, tls_cert) =
            self.sign_leaf(dns_names, &issuer, OffsetDateTime::now_utc())?;

        Ok(CertificateBundle {
            ca_key: ca_key_pem.to_vec(),
            ca_cert: ca_cert_pem.to_vec(),
            tls_key,
            tls_cert,
        })
    }

    /// Returns the PEM key and certificate of a leaf carrying exactly `dns_names`.
    fn sign_leaf(
        &self,
        dns_names: &[String],
        issuer: &Issuer<'_, &KeyPair>,
        now: OffsetDateTime,
    ) -> Result<(Vec<u8>, Vec<u8>), GenerationError> {
        let common_name = dns_names.first().ok_or(GenerationError::NoDnsNames)?;

        let leaf_key = KeyPair::generate().map_err(|source| GenerationError::KeyGeneration {
            what: "serving",
            source,
        })?;

        let mut leaf_params = CertificateParams::new(dns_names.to_vec()).map_err(|source| {
            GenerationError::Signing {
                what: "serving",
                source,
            }
        })?;
        leaf_params.distinguished_name = distinguished_name(common_name);
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        leaf_params.not_before = now - Duration::hours(1);
        leaf_params.not_after = now + self.leaf_validity;

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, issuer)
            .map_err(|source| GenerationError::Signing {
                what: "serving",
                source,
            })?;

        Ok((
            leaf_key.serialize_pem().into_bytes(),
            leaf_cert.pem().into_bytes(),
        ))
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn parse_pem(data: &[u8], what: &'static str) -> Result<Pem, CertificateError> {
    parse_x509_pem(data)
        .map(|(_, pem)| pem)
        .map_err(|e| CertificateError::Pem {
            what,
            reason: e.to_string(),
        })
}

fn parse_cert<'a>(pem: &'a Pem, what: &'static str) -> Result<X509Certificate<'a>, CertificateError> {
    pem.parse_x509().map_err(|e| CertificateError::Parse {
        what,
        reason: e.to_string(),
    })
}

/// Checks that `data` is a PEM certificate.
pub fn check_certificate_pem(data: &[u8], what: &'static str) -> Result<(), CertificateError> {
    let pem = parse_pem(data, what)?;
    parse_cert(&pem, what).map(|_| ())
}

/// Checks that `ca_cert_pem` is a CA certificate still valid at `at`.
pub fn verify_ca(ca_cert_pem: &[u8], at: OffsetDateTime) -> Result<(), CertificateError> {
    let pem = parse_pem(ca_cert_pem, "CA certificate")?;
    let ca = parse_cert(&pem, "CA certificate")?;
    if !ca.is_ca() {
        return Err(CertificateError::NotCa);
    }
    check_validity(&ca, "CA certificate", at)
}

fn check_validity(
    cert: &X509Certificate<'_>,
    what: &'static str,
    at: OffsetDateTime,
) -> Result<(), CertificateError> {
    let ts = at.unix_timestamp();
    let validity = cert.validity();
    if ts < validity.not_before.timestamp() || ts > validity.not_after.timestamp() {
        return Err(CertificateError::OutsideValidity { what, at });
    }
    Ok(())
}

/// Verifies the serving leaf against the CA as it would be verified at `at`.
///
/// Passing a time in the future makes certificates that expire before then
/// count as invalid.
pub fn verify_leaf(
    ca_cert_pem: &[u8],
    tls_cert_pem: &[u8],
    dns_name: &str,
    at: OffsetDateTime,
) -> Result<(), CertificateError> {
    let ca_pem = parse_pem(ca_cert_pem, "CA certificate")?;
    let ca = parse_cert(&ca_pem, "CA certificate")?;
    let leaf_pem = parse_pem(tls_cert_pem, "serving certificate")?;
    let leaf = parse_cert(&leaf_pem, "serving certificate")?;

    if !ca.is_ca() {
        return Err(CertificateError::NotCa);
    }
    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| CertificateError::Signature(e.to_string()))?;

    check_validity(&ca, "CA certificate", at)?;
    check_validity(&leaf, "serving certificate", at)?;

    if !dns_names_of(&leaf)
        .iter()
        .any(|name| name.eq_ignore_ascii_case(dns_name))
    {
        return Err(CertificateError::DnsNameMismatch(dns_name.to_string()));
    }

    // A leaf without the extension is usable for any purpose.
    if let Ok(Some(eku)) = leaf.extended_key_usage() {
        if !eku.value.any && !eku.value.server_auth {
            return Err(CertificateError::NotServerAuth);
        }
    }

    Ok(())
}

/// DNS subject alternative names carried by a PEM certificate.
pub fn subject_alt_dns_names(cert_pem: &[u8]) -> Result<Vec<String>, CertificateError> {
    let pem = parse_pem(cert_pem, "certificate")?;
    let cert = parse_cert(&pem, "certificate")?;
    Ok(dns_names_of(&cert))
}

fn dns_names_of(cert: &X509Certificate<'_>) -> Vec<String> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> Vec<String> {
        vec![
            "pm".to_string(),
            "pm.tf-system".to_string(),
            "pm.tf-system.svc".to_string(),
            "pm.tf-system.svc.cluster.local".to_string(),
        ]
    }

    #[test]
    fn issued_leaf_verifies_for_every_alias() {
        let bundle = CertificateAuthority::default().issue(&aliases()).unwrap();
        let now = OffsetDateTime::now_utc();

        for name in aliases() {
            verify_leaf(&bundle.ca_cert, &bundle.tls_cert, &name, now).unwrap();
        }
    }

    #[test]
    fn issued_leaf_carries_exact_san_set() {
        let bundle = CertificateAuthority::default().issue(&aliases()).unwrap();
        assert_eq!(subject_alt_dns_names(&bundle.tls_cert).unwrap(), aliases());
    }

    #[test]
    fn issued_material_is_pem() {
        let bundle = CertificateAuthority::default().issue(&aliases()).unwrap();

        check_certificate_pem(&bundle.ca_cert, "ca").unwrap();
        check_certificate_pem(&bundle.tls_cert, "tls").unwrap();
        assert!(String::from_utf8_lossy(&bundle.ca_key).contains("PRIVATE KEY"));
        assert!(String::from_utf8_lossy(&bundle.tls_key).contains("PRIVATE KEY"));
        assert!(check_certificate_pem(&bundle.tls_key, "tls key").is_err());
    }

    #[test]
    fn empty_dns_names_are_rejected() {
        let result = CertificateAuthority::default().issue(&[]);
        assert!(matches!(result, Err(GenerationError::NoDnsNames)));
    }

    #[test]
    fn leaf_expiring_inside_margin_is_invalid() {
        let ca = CertificateAuthority::new(Duration::days(3650), Duration::days(10));
        let bundle = ca.issue(&aliases()).unwrap();
        let now = OffsetDateTime::now_utc();

        verify_leaf(&bundle.ca_cert, &bundle.tls_cert, "pm", now).unwrap();
        let err = verify_leaf(&bundle.ca_cert, &bundle.tls_cert, "pm", now + Duration::days(30))
            .unwrap_err();
        assert!(matches!(err, CertificateError::OutsideValidity { .. }));
    }

    #[test]
    fn leaf_expiring_after_margin_is_valid() {
        let ca = CertificateAuthority::new(Duration::days(3650), Duration::days(60));
        let bundle = ca.issue(&aliases()).unwrap();
        let later = OffsetDateTime::now_utc() + Duration::days(30);

        verify_leaf(&bundle.ca_cert, &bundle.tls_cert, "pm", later).unwrap();
    }

    #[test]
    fn leaf_from_other_ca_is_rejected() {
        let first = CertificateAuthority::default().issue(&aliases()).unwrap();
        let second = CertificateAuthority::default().issue(&aliases()).unwrap();

        let result = verify_leaf(
            &second.ca_cert,
            &first.tls_cert,
            "pm",
            OffsetDateTime::now_utc(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn reissued_leaf_is_signed_by_existing_ca() {
        let ca = CertificateAuthority::new(Duration::days(3650), Duration::days(5));
        let original = ca.issue(&aliases()).unwrap();

        let renewed = CertificateAuthority::default()
            .reissue_leaf(&original.ca_key, &original.ca_cert, &aliases())
            .unwrap();

        assert_eq!(renewed.ca_cert, original.ca_cert);
        assert_eq!(renewed.ca_key, original.ca_key);
        assert_ne!(renewed.tls_cert, original.tls_cert);
        let later = OffsetDateTime::now_utc() + Duration::days(30);
        verify_leaf(&original.ca_cert, &renewed.tls_cert, "pm", later).unwrap();
        assert_eq!(subject_alt_dns_names(&renewed.tls_cert).unwrap(), aliases());
    }

    #[test]
    fn reissue_rejects_unusable_ca_material() {
        let bundle = CertificateAuthority::default().issue(&aliases()).unwrap();

        let err = CertificateAuthority::default()
            .reissue_leaf(b"not a key", &bundle.ca_cert, &aliases())
            .unwrap_err();
        assert!(matches!(err, GenerationError::LoadCa(_)));
    }

    #[test]
    fn ca_validity_is_checked_at_given_instant() {
        let ca = CertificateAuthority::new(Duration::days(10), Duration::days(5));
        let bundle = ca.issue(&aliases()).unwrap();
        let now = OffsetDateTime::now_utc();

        verify_ca(&bundle.ca_cert, now).unwrap();
        assert!(matches!(
            verify_ca(&bundle.ca_cert, now + Duration::days(30)),
            Err(CertificateError::OutsideValidity { .. })
        ));
        assert!(matches!(
            verify_ca(&bundle.tls_cert, now),
            Err(CertificateError::NotCa)
        ));
    }

    #[test]
    fn unknown_dns_name_is_rejected() {
        let bundle = CertificateAuthority::default().issue(&aliases()).unwrap();

        let err = verify_leaf(
            &bundle.ca_cert,
            &bundle.tls_cert,
            "other.example.com",
            OffsetDateTime::now_utc(),
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::DnsNameMismatch(_)));
    }

    #[test]
    fn garbage_is_not_pem() {
        let err = check_certificate_pem(b"not a certificate", "ca").unwrap_err();
        assert!(matches!(err, CertificateError::Pem { .. }));
    }
}
