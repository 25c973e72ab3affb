//! TLS configuration: listener acceptor and backend connector.

use crate::config::{BackendTlsSettings, ListenerTlsSettings};
use crate::error::ProxyError;
use crate::stream::BackendStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Loads the listener certificate and creates a TLS acceptor.
pub fn create_tls_acceptor(config: &ListenerTlsSettings) -> Result<TlsAcceptor, ProxyError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ProxyError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ProxyError::TlsConfig("key_path not set".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// A TLS connector for backend connections, carrying the SNI override.
pub struct BackendTls {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl BackendTls {
    /// Builds a verifying connector from backend TLS settings.
    pub fn from_settings(config: &BackendTlsSettings) -> Result<Self, ProxyError> {
        if config.insecure {
            return Self::insecure(config.server_name.clone());
        }

        let root_store = if let Some(ref ca_path) = config.ca_cert_path {
            let certs = load_certs(ca_path)?;
            let mut store = RootCertStore::empty();
            for cert in certs {
                store
                    .add(cert)
                    .map_err(|e| ProxyError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
            store
        } else {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        };

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

        let client_config = if let (Some(cert_path), Some(key_path)) =
            (&config.client_cert_path, &config.client_key_path)
        {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ProxyError::TlsConfig(format!("invalid client cert/key: {}", e)))?
        } else {
            builder.with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: config.server_name.clone(),
        })
    }

    /// Builds a connector that skips certificate verification.
    ///
    /// The health checker connects to `127.0.0.1` where the listener
    /// certificate hostname can never match.
    pub fn insecure(server_name: Option<String>) -> Result<Self, ProxyError> {
        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    /// Upgrades a dialed TCP stream to TLS.
    pub async fn connect(
        &self,
        addr: &str,
        tcp: TcpStream,
    ) -> Result<BackendStream, ProxyError> {
        let host = self
            .server_name
            .clone()
            .unwrap_or_else(|| addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr).to_string());
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| ProxyError::TlsConfig(format!("invalid server name: {}", host)))?;

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
        Ok(BackendStream::Tls { stream })
    }
}

/// Extracts the subject of the first certificate in a PEM file, in the
/// `CN=...,OU=...,O=...` form MongoDB expects as an X.509 username.
///
/// Only single-valued components are included; commas inside a value are
/// escaped.
pub fn certificate_subject(path: &Path) -> Result<String, ProxyError> {
    let certs = load_certs(path)?;
    let cert = certs
        .first()
        .ok_or_else(|| ProxyError::TlsConfig(format!("no certificate found in {:?}", path)))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| ProxyError::TlsConfig(format!("cannot parse certificate {:?}: {}", path, e)))?;

    let subject = parsed.subject();
    let mut components = Vec::new();
    push_subject_component(&mut components, "CN", subject.iter_common_name());
    push_subject_component(&mut components, "OU", subject.iter_organizational_unit());
    push_subject_component(&mut components, "O", subject.iter_organization());
    push_subject_component(&mut components, "L", subject.iter_locality());
    push_subject_component(&mut components, "ST", subject.iter_state_or_province());
    push_subject_component(&mut components, "C", subject.iter_country());

    if components.is_empty() {
        return Err(ProxyError::TlsConfig(format!(
            "certificate in {:?} has an empty subject",
            path
        )));
    }
    Ok(components.join(","))
}

fn push_subject_component<'a>(
    out: &mut Vec<String>,
    tag: &str,
    values: impl Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'a>>,
) {
    let values: Vec<&str> = values.filter_map(|v| v.as_str().ok()).collect();
    if let [value] = values[..] {
        out.push(format!("{}={}", tag, value.replace(',', "\\,")));
    }
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ProxyError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ProxyError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
