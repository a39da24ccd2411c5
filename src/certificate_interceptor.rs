use crossbeam::atomic::AtomicCell;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fmt::Debug;
use tokio_rustls::rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::ring,
    DigitallySignedStruct, Error as TlsError, SignatureScheme,
};

/// Records the certificate chain presented during the handshake and accepts
/// it unconditionally. The monitor inventories endpoints it does not trust,
/// so the chain must be observable even when it would fail verification.
pub struct CertificateInterceptor {
    certificates: AtomicCell<Option<Vec<CertificateDer<'static>>>>,
}

impl CertificateInterceptor {
    pub fn new() -> Self {
        Self {
            certificates: Default::default(),
        }
    }

    /// Takes the chain captured by the last handshake, in presented order.
    pub fn get_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.certificates.take()
    }
}

impl Default for CertificateInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CertificateInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInterceptor")
            .field("certificates", &"<Redacted>")
            .finish()
    }
}

impl ServerCertVerifier for CertificateInterceptor {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let mut certs = vec![end_entity.clone().into_owned()];
        certs.extend(intermediates.iter().map(|cert| cert.clone().into_owned()));

        self.certificates.store(Some(certs));
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
