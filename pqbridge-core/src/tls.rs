//! TLS client configuration for the broker connection
//!
//! Builds a rustls `ClientConfig` restricted to a single key-exchange group,
//! trusting the anchors from a PEM file. Server certificate verification can
//! be switched off for lab brokers with self-issued certificates; handshake
//! signatures are still checked in that mode.

use crate::kx::KeyExchangeGroup;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// TLS options for the broker session
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the broker certificate against the trust anchors
    pub verify_server_cert: bool,
    /// PEM file with trust anchors
    pub ca_path: Option<PathBuf>,
    /// Key-exchange group offered in the handshake
    pub group: KeyExchangeGroup,
}

impl TlsOptions {
    /// Build the rustls client configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let kx = self.group.rustls_group().ok_or_else(|| {
            Error::Tls(format!(
                "key exchange group {} is not provided by the linked TLS backend",
                self.group
            ))
        })?;

        let provider = Arc::new(CryptoProvider {
            kx_groups: vec![kx],
            ..rustls::crypto::ring::default_provider()
        });
        let algorithms = provider.signature_verification_algorithms;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let config = if self.verify_server_cert {
            let ca_path = self.ca_path.as_deref().ok_or_else(|| {
                Error::Tls("server certificate verification requires a CA path".to_string())
            })?;
            builder
                .with_root_certificates(load_roots(ca_path)?)
                .with_no_client_auth()
        } else {
            warn!("Broker certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
                .with_no_client_auth()
        };

        debug!("TLS configured with key exchange group {}", self.group);
        Ok(config)
    }
}

/// Load trust anchors from a PEM file
pub fn load_roots(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Cannot open CA file {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Invalid PEM in {}: {}", path.display(), e)))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unparsable certificate(s) in {}", ignored, path.display());
    }
    if added == 0 {
        return Err(Error::Tls(format!("No certificates found in {}", path.display())));
    }
    Ok(roots)
}

/// Accepts any server certificate but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
