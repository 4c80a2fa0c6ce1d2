//! Transport security for tunnel server connections
//!
//! Destinations either run plaintext or TLS with peer verification disabled.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use outpost_core::error::ConnectionError;
use outpost_protocol::DynStream;

use crate::tree::Destination;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Wraps dialed transports according to the destination's TLS setting
#[derive(Clone)]
pub struct TransportSecurity {
    connector: TlsConnector,
}

impl TransportSecurity {
    pub fn new() -> Self {
        ensure_crypto_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Return `stream` as is for `no_tls` destinations, otherwise run the
    /// TLS handshake over it.
    pub async fn secure(&self, stream: DynStream, destination: &Destination) -> Result<DynStream, ConnectionError> {
        if destination.no_tls {
            return Ok(stream);
        }

        let host = destination
            .address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|e| ConnectionError::Tls(format!("invalid server name {:?}: {}", destination.address, e)))?;

        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ConnectionError::Tls(format!("handshake with {} failed: {}", destination.server_address(), e)))?;
        Ok(Box::new(stream))
    }
}

impl Default for TransportSecurity {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
