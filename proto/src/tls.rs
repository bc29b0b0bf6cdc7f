//! TLS policy surface: builds the `rustls` configs this system's listener and
//! dialer wrap their TCP connections in. The TLS handshake and record layer
//! themselves are `rustls`'s problem; this module only encodes the policy
//! described for this system — which certs are required, whether the peer's
//! identity is checked, and the optional SHA-512 fingerprint allowlist.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{AllowAnyAuthenticatedClient, ClientCertVerified, ClientCertVerifier, NoClientAuth};
use rustls::{Certificate, ClientConfig, Error as TlsLibError, PrivateKey, RootCertStore, ServerConfig, ServerName};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tunsock_common::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("reading {path}: {source}")]
    Read { path: String, #[source] source: io::Error },
    #[error("{path} contains no usable certificate")]
    NoCertificates { path: String },
    #[error("{path} contains no usable private key")]
    NoPrivateKey { path: String },
    #[error(transparent)]
    Rustls(#[from] TlsLibError),
}

pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsConfigError> {
    let file = File::open(path).map_err(|source| TlsConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|source| TlsConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates {
            path: path.display().to_string(),
        });
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsConfigError> {
    let bytes = std::fs::read(path).map_err(|source| TlsConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    if let Ok(mut keys) = rustls_pemfile::pkcs8_private_keys(&mut &bytes[..]) {
        if let Some(key) = keys.pop() {
            return Ok(PrivateKey(key));
        }
    }
    if let Ok(mut keys) = rustls_pemfile::rsa_private_keys(&mut &bytes[..]) {
        if let Some(key) = keys.pop() {
            return Ok(PrivateKey(key));
        }
    }
    Err(TlsConfigError::NoPrivateKey {
        path: path.display().to_string(),
    })
}

fn root_store_from(ca_certs: Vec<Certificate>) -> Result<RootCertStore, TlsConfigError> {
    let mut store = RootCertStore::empty();
    for cert in ca_certs {
        store
            .add(&cert)
            .map_err(|_| TlsConfigError::NoCertificates {
                path: "CA file".to_string(),
            })?;
    }
    Ok(store)
}

/// Build the listening side's config: a server cert+key is mandatory. A CA
/// file, if given, requires an authenticated client cert from that CA; a
/// fingerprint set, if given, additionally restricts which client certs (by
/// SHA-512 digest) are accepted.
pub fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
    fingerprints: Option<&[Fingerprint]>,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let client_verifier: Arc<dyn ClientCertVerifier> = match ca_path {
        Some(ca_path) => {
            let roots = root_store_from(load_certs(ca_path)?)?;
            let base = AllowAnyAuthenticatedClient::new(roots);
            match fingerprints {
                Some(set) if !set.is_empty() => {
                    Arc::new(FingerprintGatedVerifier::new(base, set.to_vec()))
                }
                _ => base,
            }
        }
        None => NoClientAuth::new(),
    };

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build the dialing side's config. `verify_peer = false` disables server
/// certificate verification entirely (the `-V` flag); otherwise the system
/// root store (no client cert of our own) is used.
pub fn build_client_config(verify_peer: bool) -> Arc<ClientConfig> {
    let builder = ClientConfig::builder().with_safe_defaults();
    let config = if verify_peer {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots_trust_anchors());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .with_custom_certificate_verifier(Arc::new(DisableVerification))
            .with_no_client_auth()
    };
    Arc::new(config)
}

fn webpki_roots_trust_anchors() -> Vec<rustls::OwnedTrustAnchor> {
    webpki_roots::TLS_SERVER_ROOTS
        .iter()
        .map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        })
        .collect()
}

struct DisableVerification;

impl ServerCertVerifier for DisableVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsLibError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Wraps a CA-based [`ClientCertVerifier`] with an additional SHA-512
/// fingerprint allowlist: a client cert must pass the inner (CA chain)
/// verification *and* hash to one of the configured fingerprints.
struct FingerprintGatedVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    allowed: Vec<Fingerprint>,
}

impl FingerprintGatedVerifier {
    fn new(inner: Arc<dyn ClientCertVerifier>, allowed: Vec<Fingerprint>) -> Self {
        Self { inner, allowed }
    }
}

impl ClientCertVerifier for FingerprintGatedVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn client_auth_root_subjects(&self) -> Option<rustls::DistinguishedNames> {
        self.inner.client_auth_root_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        now: SystemTime,
    ) -> Result<ClientCertVerified, TlsLibError> {
        let verified = self.inner.verify_client_cert(end_entity, intermediates, now)?;

        let digest = Sha512::digest(&end_entity.0);
        let hex = hex::encode(digest);
        let matched = self
            .allowed
            .iter()
            .any(|fp| hex::encode(fp.as_bytes()) == hex);
        if !matched {
            return Err(TlsLibError::General(
                "client certificate fingerprint not in the configured set".to_string(),
            ));
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_mismatch_is_rejected() {
        let inner: Arc<dyn ClientCertVerifier> = NoClientAuth::new();
        let allowed = vec![Fingerprint::from_hex(&"ab".repeat(64)).unwrap()];
        let verifier = FingerprintGatedVerifier::new(inner, allowed);

        // NoClientAuth never actually accepts a verify_client_cert call in
        // practice (offer_client_auth is false), so exercise the digest
        // comparison path directly instead of going through a real chain.
        let cert = Certificate(b"not a real certificate".to_vec());
        let digest = Sha512::digest(&cert.0);
        let hex = hex::encode(digest);
        assert!(!verifier.allowed.iter().any(|fp| hex::encode(fp.as_bytes()) == hex));
    }
}
