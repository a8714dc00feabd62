//! Mutually authenticated transport material for the engine connection.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relaunch_common::UpdateError;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::{certs, private_key};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Proof that the three credential files form a usable mutual-TLS client
/// context: the CA pool parses as trusted roots and the key matches the
/// client certificate. The engine connection itself is built by bollard
/// from the same paths; this only fails fast with a precise error.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    paths: TlsPaths,
}

impl SecureChannel {
    /// Reads and parses all three files. Nothing is cached; every call goes
    /// back to disk.
    pub fn provision(paths: &TlsPaths) -> Result<Self, UpdateError> {
        let roots = load_roots(&paths.ca_cert)?;
        let chain = load_certs(&paths.client_cert)?;
        let key = load_key(&paths.client_key)?;

        // Explicit provider: bollard may enable a second rustls backend.
        ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| credential_error(&paths.client_cert, e))?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| credential_error(&paths.client_key, e))?;

        debug!(ca = %paths.ca_cert.display(), cert = %paths.client_cert.display(), "TLS credentials loaded");
        Ok(Self {
            paths: paths.clone(),
        })
    }

    pub fn paths(&self) -> &TlsPaths {
        &self.paths
    }
}

/// Makes ring the process-wide rustls provider unless one is already set,
/// so connection code that relies on the default keeps working when more
/// than one backend is compiled in.
pub fn install_default_provider() {
    if default_provider().install_default().is_ok() {
        debug!("Installed ring as the default rustls crypto provider");
    }
}

fn credential_error(path: &Path, reason: impl ToString) -> UpdateError {
    UpdateError::CredentialLoad {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn open(path: &Path) -> Result<BufReader<File>, UpdateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| credential_error(path, e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, UpdateError> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| credential_error(path, e))?;
    if chain.is_empty() {
        return Err(credential_error(path, "no certificates found"));
    }
    Ok(chain)
}

fn load_roots(path: &Path) -> Result<RootCertStore, UpdateError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| credential_error(path, e))?;
    }
    Ok(roots)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, UpdateError> {
    let mut reader = open(path)?;
    private_key(&mut reader)
        .map_err(|e| credential_error(path, e))?
        .ok_or_else(|| credential_error(path, "no private key found"))
}
