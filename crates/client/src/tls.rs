//! TLS client configuration for the core server connection.
//!
//! Verification uses the built-in web PKI roots, optionally extended with a
//! user-supplied CA bundle. `skip_verify` swaps in a verifier that accepts
//! anything; that path exists for development servers with self-signed
//! certificates.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

use crate::config::TlsConfig;
use crate::error::{ClientError, Result};

fn ensure_crypto_provider_installed() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub(crate) fn build_client_config(cfg: &TlsConfig) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider_installed();

    if cfg.skip_verify {
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &cfg.ca_cert {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ClientError::Config(format!("invalid CA certificate: {e}")))?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClientError::Config(format!("open CA certificate {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Config(format!("parse CA certificate {}: {e}", path.display())))
}

/// Accepts any server certificate. Installed only when `skip_verify` is set.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_verify_builds() {
        let config = build_client_config(&TlsConfig {
            skip_verify: true,
            ..TlsConfig::default()
        });
        assert!(config.is_ok());
    }

    #[test]
    fn default_roots_build() {
        let config = build_client_config(&TlsConfig::default());
        assert!(config.is_ok());
    }

    #[test]
    fn missing_ca_file_is_config_error() {
        let config = build_client_config(&TlsConfig {
            ca_cert: Some("/does/not/exist.pem".into()),
            ..TlsConfig::default()
        });
        assert!(matches!(config, Err(ClientError::Config(_))));
    }
}
