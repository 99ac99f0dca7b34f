//! Client credentials for the cloud channel.
//!
//! Loads the agent's private key and certificate, builds the rustls client
//! configuration used for mutual authentication, and derives the agent
//! identifier from the certificate subject CN. The identifier is parsed once
//! and immutable for the process lifetime.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::defaults::{CLIENT_CERT_FILE, CLIENT_KEY_FILE};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("cannot read `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no private key found in `{0}`")]
    NoPrivateKey(PathBuf),
    #[error("no certificate found in `{0}`")]
    NoCertificate(PathBuf),
    #[error("cannot parse client certificate: {0}")]
    ParseCertificate(String),
    #[error("client certificate subject has no common name")]
    EmptyCommonName,
    #[error("cannot load system root certificates: {0}")]
    RootStore(String),
    #[error("error building tls config: `{0}`")]
    TlsConfig(#[from] rustls::Error),
}

/// The agent's identity: certificate-derived identifier plus the TLS client
/// configuration for the cloud session.
#[derive(Debug)]
pub struct Identity {
    agent_id: String,
    tls_config: Arc<ClientConfig>,
}

impl Identity {
    /// Loads `client.key`/`client.crt` from `credentials_dir` and fails fast
    /// if either is absent, unreadable, or the certificate CN is empty.
    pub fn load(credentials_dir: &Path) -> Result<Self, IdentityError> {
        let key_path = credentials_dir.join(CLIENT_KEY_FILE);
        let cert_path = credentials_dir.join(CLIENT_CERT_FILE);

        let key = load_private_key(&key_path)?;
        let certs = load_certificates(&cert_path)?;
        let agent_id = subject_common_name(&certs[0])?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs()
            .map_err(|e| IdentityError::RootStore(e.to_string()))?
        {
            if let Err(e) = roots.add(cert) {
                warn!(error_msg = %e, "skipping unusable system root certificate");
            }
        }

        // rustls negotiates TLS 1.2 as its floor by default.
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(Self {
            agent_id,
            tls_config: Arc::new(tls_config),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls_config.clone()
    }
}

/// Install the default rustls crypto provider, this needs to be executed early in the process.
pub fn install_rustls_default_crypto_provider() {
    rustls::crypto::ring::default_provider().install_default().unwrap_or_else(|_| {
        warn!("rustls default crypto provider was already installed for this process, this has no effect")
    })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, IdentityError> {
    let data = std::fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| IdentityError::NoPrivateKey(path.to_path_buf()))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let data = std::fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(IdentityError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn subject_common_name(cert: &CertificateDer<'_>) -> Result<String, IdentityError> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| IdentityError::ParseCertificate(e.to_string()))?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default();

    if cn.is_empty() {
        return Err(IdentityError::EmptyCommonName);
    }
    Ok(cn.to_string())
}
