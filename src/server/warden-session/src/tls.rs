//! TLS configuration for the agent channel.
//!
//! Two server postures: the bootstrap listener presents the server
//! certificate and requires no client certificate (agents authenticate
//! with AppRole inside the stream); the session listener requires client
//! certificates chaining to the internal CA. Post-handshake, the peer
//! chain is re-verified against revocation state in storage; webpki
//! only proves the chain, not that it is still live.

use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::SessionError;

/// Parses a concatenated PEM bundle into DER certificates.
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, SessionError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SessionError::Tls(format!("bad certificate PEM: {e}")))
}

/// Parses a PEM private key.
pub fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, SessionError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SessionError::Tls(format!("bad key PEM: {e}")))?
        .ok_or_else(|| SessionError::Tls("no private key in PEM".into()))
}

/// Builds a root store from a PEM CA bundle.
pub fn root_store_from_pem(ca_pem: &str) -> Result<RootCertStore, SessionError> {
    let mut store = RootCertStore::empty();
    for cert in certs_from_pem(ca_pem)? {
        store
            .add(cert)
            .map_err(|e| SessionError::Tls(format!("bad CA certificate: {e}")))?;
    }
    if store.is_empty() {
        return Err(SessionError::Tls("empty CA bundle".into()));
    }
    Ok(store)
}

/// Server config for the bootstrap listener (no client certificates).
pub fn bootstrap_server_config(
    server_cert_pem: &str,
    server_key_pem: &str,
) -> Result<Arc<ServerConfig>, SessionError> {
    let certs = certs_from_pem(server_cert_pem)?;
    let key = key_from_pem(server_key_pem)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Server config for the session listener (mandatory client certificates
/// chaining to the internal CA).
pub fn mtls_server_config(
    server_cert_pem: &str,
    server_key_pem: &str,
    ca_pem: &str,
) -> Result<Arc<ServerConfig>, SessionError> {
    let roots = root_store_from_pem(ca_pem)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SessionError::Tls(format!("client verifier: {e}")))?;

    let certs = certs_from_pem(server_cert_pem)?;
    let key = key_from_pem(server_key_pem)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Client config trusting the internal CA, without a client certificate
/// (bootstrap).
pub fn bootstrap_client_config(ca_pem: &str) -> Result<Arc<ClientConfig>, SessionError> {
    let roots = root_store_from_pem(ca_pem)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Client config trusting the internal CA and presenting a client
/// certificate (established sessions).
pub fn mtls_client_config(
    ca_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Result<Arc<ClientConfig>, SessionError> {
    let roots = root_store_from_pem(ca_pem)?;
    let certs = certs_from_pem(client_cert_pem)?;
    let key = key_from_pem(client_key_pem)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Parses a DNS server name for connecting.
pub fn server_name(name: &str) -> Result<ServerName<'static>, SessionError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| SessionError::Tls(format!("bad server name {name:?}: {e}")))
}

/// Encodes a DER certificate as PEM.
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        // Chunks of a base64 string are valid UTF-8.
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn self_signed() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "test");
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_parse_pem_material() {
        let (cert_pem, key_pem) = self_signed();

        let certs = certs_from_pem(&cert_pem).unwrap();
        assert_eq!(certs.len(), 1);

        key_from_pem(&key_pem).unwrap();

        let store = root_store_from_pem(&cert_pem).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_configs_build() {
        let (cert_pem, key_pem) = self_signed();

        bootstrap_server_config(&cert_pem, &key_pem).unwrap();
        mtls_server_config(&cert_pem, &key_pem, &cert_pem).unwrap();
        bootstrap_client_config(&cert_pem).unwrap();
        mtls_client_config(&cert_pem, &cert_pem, &key_pem).unwrap();
        server_name("localhost").unwrap();
    }

    #[test]
    fn test_der_to_pem_roundtrip() {
        let (cert_pem, _) = self_signed();
        let der = certs_from_pem(&cert_pem).unwrap().remove(0);

        let pem = der_to_pem(der.as_ref());
        let reparsed = certs_from_pem(&pem).unwrap();
        assert_eq!(reparsed[0].as_ref(), der.as_ref());
    }

    #[test]
    fn test_empty_bundle_rejected() {
        assert!(root_store_from_pem("").is_err());
    }
}
