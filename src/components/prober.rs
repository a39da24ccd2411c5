use crate::{
    certificate_interceptor::CertificateInterceptor,
    types::{check_certificate, CertRow, StateRow, Validity},
};
use rustls_pki_types::{CertificateDer, ServerName};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{rustls::ClientConfig, TlsConnector};

/// Probes an endpoint's TLS certificate chain and evaluates the outcome
/// into a state row.
#[derive(Clone, Debug)]
pub struct Prober {
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Dials `host` and performs a TLS handshake with `sni`, both bounded by
    /// the configured timeout. Returns the chain in presented order, or
    /// `None` on any failure. Nothing is verified: the interceptor captures
    /// whatever the server offers.
    pub async fn fetch_chain(&self, host: &str, sni: &str) -> Option<Vec<CertificateDer<'static>>> {
        let server_name = match ServerName::try_from(sni.to_owned()) {
            Ok(name) => name,
            Err(_) => {
                warn!("Invalid server name '{}' for {}", sni, host);
                return None;
            }
        };

        let interceptor = Arc::new(CertificateInterceptor::new());
        let tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(interceptor.clone())
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let stream = match timeout(self.timeout, TcpStream::connect(host)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to establish TCP connection to {}: {}", host, e);
                return None;
            }
            Err(_) => {
                warn!("TCP connection to {} timed out", host);
                return None;
            }
        };

        match timeout(self.timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(_conn)) => {}
            Ok(Err(e)) => {
                warn!("Failed to handshake with {}: {}", host, e);
                return None;
            }
            Err(_) => {
                warn!("Handshake with {} timed out", host);
                return None;
            }
        }

        interceptor.get_certificates()
    }

    /// Probes the state's endpoint and rewrites its outcome fields.
    ///
    /// Unreachable endpoints become Unknown with an empty chain. Otherwise
    /// every chain entry is recorded and checked; only the leaf is matched
    /// against the SNI, later entries get the expiry-window check alone.
    pub async fn update_state(&self, state: &mut StateRow) {
        let Some(chain) = self.fetch_chain(&state.host, &state.sni).await else {
            state.validity = Validity::Unknown;
            state.certificates.clear();
            return;
        };

        state.validity = Validity::Valid;
        state.description.clear();
        state.certificates.clear();

        let sni = state.sni.clone();
        let mut hostname = sni.as_str();
        for der in &chain {
            match CertRow::from_der(der.as_ref()) {
                Ok(cert) => state.certificates.push(cert),
                Err(e) => {
                    state.validity = Validity::Invalid;
                    append_reason(&mut state.description, &format!("Unparsable certificate: {e}"));
                    hostname = "";
                    continue;
                }
            }
            if let Err(reason) = check_certificate(der.as_ref(), hostname) {
                state.validity = Validity::Invalid;
                append_reason(&mut state.description, &reason);
            }
            hostname = "";
        }
    }
}

fn append_reason(description: &mut String, reason: &str) {
    if !description.is_empty() {
        description.push('\n');
    }
    description.push_str(reason);
}
