//! Reading the upstream CA bundle and client identity from disk.
use std::{
    io::BufReader,
    path::{Path, PathBuf},
};

use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    sign::CertifiedKey,
};
use thiserror::Error;

use super::transport::{
    OutboundTransport, TransportIdentity, TransportSettings, install_crypto_provider,
};

/// Errors produced while turning credential files into a transport.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CredentialError {
    /// The CA bundle could not be read
    #[error("failed to read CA file {path}: {source}")]
    CaRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The CA bundle held no certificate usable as a trust anchor
    #[error("no usable CA certificates in {path}: {reason}")]
    CaParse { path: PathBuf, reason: String },

    /// The client certificate/key pair is unreadable, malformed or mismatched
    #[error("invalid client key pair ({cert_path}, {key_path}): {reason}")]
    KeyPair {
        cert_path: PathBuf,
        key_path: PathBuf,
        reason: String,
    },

    /// The expected upstream name is neither a DNS name nor an IP address
    #[error("invalid upstream server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },
}

/// Result type for credential loading
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Paths to the upstream credentials plus the name the upstream must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub server_name: String,
}

impl CredentialSet {
    pub fn new(
        ca_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            ca_path: ca_path.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            server_name: server_name.into(),
        }
    }

    /// The three watched files, CA first.
    pub fn paths(&self) -> [&Path; 3] {
        [&self.ca_path, &self.cert_path, &self.key_path]
    }
}

/// Builds a fresh TLS [`OutboundTransport`] from the files of a [`CredentialSet`].
///
/// Every call re-reads everything from disk. There is no caching and no retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialLoader {
    settings: TransportSettings,
}

impl CredentialLoader {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> TransportSettings {
        self.settings
    }

    pub fn load(&self, credentials: &CredentialSet) -> CredentialResult<OutboundTransport> {
        let ca_pem = std::fs::read(&credentials.ca_path).map_err(|source| CredentialError::CaRead {
            path: credentials.ca_path.clone(),
            source,
        })?;
        let (root_store, trust_roots) = parse_trust_roots(&credentials.ca_path, &ca_pem)?;

        let (client_chain, client_key) =
            read_key_pair(&credentials.cert_path, &credentials.key_path)?;

        let server_name = ServerName::try_from(credentials.server_name.clone()).map_err(|e| {
            CredentialError::InvalidServerName {
                name: credentials.server_name.clone(),
                reason: e.to_string(),
            }
        })?;

        install_crypto_provider();
        let key_pair_error = |reason: String| CredentialError::KeyPair {
            cert_path: credentials.cert_path.clone(),
            key_path: credentials.key_path.clone(),
            reason,
        };
        ensure_keys_match(&client_chain, &client_key).map_err(key_pair_error)?;

        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_root_certificates(root_store)
        .with_client_auth_cert(client_chain.clone(), client_key)
        .map_err(|e| key_pair_error(e.to_string()))?;

        let identity = TransportIdentity {
            trust_roots,
            client_chain,
            server_name,
        };

        Ok(OutboundTransport::with_tls(tls_config, identity, self.settings))
    }
}

fn parse_trust_roots(
    path: &Path,
    pem: &[u8],
) -> CredentialResult<(RootCertStore, Vec<CertificateDer<'static>>)> {
    let parse_error = |reason: String| CredentialError::CaParse {
        path: path.to_path_buf(),
        reason,
    };

    let mut root_store = RootCertStore::empty();
    let mut trust_roots = Vec::new();
    let mut last_error = None;
    for candidate in rustls_pemfile::certs(&mut BufReader::new(pem)) {
        let cert = match candidate {
            Ok(cert) => cert,
            Err(e) => {
                tracing::warn!(
                    target: "tls_reload",
                    path = %path.display(),
                    "Skipping malformed PEM block in CA bundle: {e}"
                );
                last_error = Some(e.to_string());
                continue;
            }
        };
        match root_store.add(cert.clone()) {
            Ok(()) => trust_roots.push(cert),
            Err(e) => {
                tracing::warn!(
                    target: "tls_reload",
                    path = %path.display(),
                    "Skipping unusable CA certificate: {e}"
                );
                last_error = Some(e.to_string());
            }
        }
    }

    if trust_roots.is_empty() {
        return Err(parse_error(
            last_error.unwrap_or_else(|| "no PEM certificates found".to_string()),
        ));
    }
    Ok((root_store, trust_roots))
}

fn read_key_pair(
    cert_path: &Path,
    key_path: &Path,
) -> CredentialResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key_pair_error = |reason: String| CredentialError::KeyPair {
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        reason,
    };

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| key_pair_error(format!("reading certificate: {e}")))?;
    let key_pem =
        std::fs::read(key_path).map_err(|e| key_pair_error(format!("reading key: {e}")))?;

    let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| key_pair_error(format!("parsing certificate: {e}")))?;
    if chain.is_empty() {
        return Err(key_pair_error("no certificate found".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|e| key_pair_error(format!("parsing key: {e}")))?
        .ok_or_else(|| key_pair_error("no private key found".to_string()))?;

    Ok((chain, key))
}

fn ensure_keys_match(
    chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<(), String> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| "no crypto provider installed".to_string())?;
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| e.to_string())?;

    match CertifiedKey::new(chain.to_vec(), signing_key).keys_match() {
        Ok(()) => Ok(()),
        // Key types that cannot report their public half are accepted as is.
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}
