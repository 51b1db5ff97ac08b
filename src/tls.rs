//! Broker-side TLS context: mutual TLS with pinned protocol versions.
//!
//! The hub's only listener speaks TLS 1.3/1.2 and requires a client
//! certificate anchored in the trust material. The same context backs the
//! optional HTTPS admin surface.

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The key and trust material on disk, all PEM. `crl` is optional; when
/// present it participates in client-certificate verification and in the
/// rotation watch.
#[derive(Clone, Debug)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    pub crl: Option<PathBuf>,
}

impl TlsPaths {
    /// Files the rotation service watches for modification.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.cert.clone(), self.key.clone(), self.ca.clone()];
        if let Some(crl) = &self.crl {
            files.push(crl.clone());
        }
        files
    }
}

/// A built server-side TLS context, ready to hand to the broker engine.
#[derive(Clone)]
pub struct ServerTlsContext {
    pub config: Arc<ServerConfig>,
}

impl std::fmt::Debug for ServerTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsContext").finish_non_exhaustive()
    }
}

/// Build the broker's server context from material on disk.
///
/// Client authentication is required: a peer whose certificate does not chain
/// to the trust material is terminated at the TLS layer, before any MQTT
/// traffic.
pub fn build_server_context(paths: &TlsPaths) -> Result<ServerTlsContext> {
    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&paths.ca)? {
        roots
            .add(cert)
            .map_err(|e| anyhow!("failed to add trust anchor from {}: {}", paths.ca.display(), e))?;
    }
    if roots.is_empty() {
        return Err(anyhow!(
            "trust material {} contains no certificates",
            paths.ca.display()
        ));
    }

    let mut verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
    if let Some(crl_path) = &paths.crl {
        verifier_builder = verifier_builder.with_crls(load_crls(crl_path)?);
    }
    let verifier = verifier_builder
        .build()
        .map_err(|e| anyhow!("failed to build client certificate verifier: {}", e))?;

    let config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_client_cert_verifier(verifier)
    .with_single_cert(certs, key)
    .map_err(|e| anyhow!("failed to build server TLS config: {}", e))?;

    log::info!(
        "TLS context built (protocols: TLSv1.3 TLSv1.2, client auth: required, crl: {})",
        paths.crl.is_some()
    );
    Ok(ServerTlsContext {
        config: Arc::new(config),
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read certificate file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to parse certificates in {}: {}", path.display(), e))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| anyhow!("failed to parse private key in {}: {}", path.display(), e))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read CRL file {}", path.display()))?;
    rustls_pemfile::crls(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to parse CRLs in {}: {}", path.display(), e))
}
