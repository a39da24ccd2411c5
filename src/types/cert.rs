use crate::error::{AppResult, ErrorReason};
use chrono::{DateTime, Utc};
use rustls_pki_types::{CertificateDer, ServerName};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sqlx::FromRow;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// One row of the `certs` table, deduplicated by fingerprint.
///
/// `expired` is seconds-until-expiry when produced by a probe and
/// days-until-expiry when read back through the `vCerts` view.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CertRow {
    #[serde(default)]
    pub id: i64,
    pub fingerprint: String,
    #[serde(default)]
    pub subject_hash: String,
    #[serde(default)]
    pub issuer_hash: String,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub domains: String,
    #[serde(default)]
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub not_before: DateTime<Utc>,
    #[serde(default)]
    pub expired: i64,
}

impl CertRow {
    /// Extracts the stored metadata from a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> AppResult<Self> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| ErrorReason::X509(e.to_string()))?;

        let domains: Vec<&str> = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(*dns),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .unwrap_or_default();
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or_default();

        Ok(Self {
            id: 0,
            fingerprint: fingerprint(der),
            subject_hash: fingerprint(cert.subject().as_raw()),
            issuer_hash: fingerprint(cert.issuer().as_raw()),
            common_name: subject_common_name(&cert),
            domains: domains.join(" "),
            not_after,
            not_before,
            expired: not_after.timestamp() - Utc::now().timestamp(),
        })
    }
}

/// Lowercase hex SHA-1 digest, the natural key for certificate rows.
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    digest.iter().fold(String::with_capacity(40), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn subject_common_name(cert: &X509Certificate<'_>) -> String {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Checks a single chain entry: the expiry window always, the hostname only
/// when one is given. Non-leaf certificates are passed an empty hostname, so
/// only the leaf is matched against the SNI.
pub fn check_certificate(der: &[u8], hostname: &str) -> Result<(), String> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| format!("Unparsable certificate: {e}"))?;

    let now = Utc::now().timestamp();
    if now > cert.validity().not_after.timestamp()
        || now < cert.validity().not_before.timestamp()
    {
        return Err(format!(
            "Certificate {} is expired or inactived yet",
            subject_common_name(&cert)
        ));
    }

    if hostname.is_empty() {
        return Ok(());
    }

    let server_name = ServerName::try_from(hostname)
        .map_err(|_| format!("Invalid server name '{hostname}'"))?;
    let cert_der = CertificateDer::from(der);
    let end_entity = webpki::EndEntityCert::try_from(&cert_der)
        .map_err(|e| format!("Unparsable certificate: {e}"))?;

    end_entity
        .verify_is_valid_for_subject_name(&server_name)
        .map_err(|e| {
            format!(
                "Certificate {} is not valid for '{}': {}",
                subject_common_name(&cert),
                hostname,
                e
            )
        })
}
