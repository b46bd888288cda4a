//! Detached File Signatures
//!
//! Signing is layered on top of TLS so that a received file can be traced
//! back to the holder of a private key, independent of the channel it
//! travelled over.
//!
//! ## Scheme
//!
//! ```text
//! file ──SHA-256──> digest (32 bytes) ──ECDSA P-256 / SHA-256──> signature (DER)
//! ```
//!
//! The digest is computed by streaming the file, so signing a large file
//! never loads it into memory. The scheme is fixed; nothing is negotiated
//! and the signature file carries no version or algorithm tag.
//!
//! Verification takes the public key from an X.509 certificate, normally
//! the self-signed one produced by [`crate::tls::generate_self_signed_cert`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::protocol::{StreamingHasher, CHUNK_SIZE, DIGEST_LEN};
use crate::tls::{load_certs, load_private_key};

/// Suffix appended to a file name to form its default signature path
pub const SIGNATURE_SUFFIX: &str = ".sig";

/// Signature service errors
///
/// A signature that does not verify is not an error; see
/// [`SignatureService::verify_file`].
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Sign and verify content digests
pub trait SignatureProvider: Send + Sync {
    /// Produce a signature over `digest` with `key`
    fn sign(
        &self,
        digest: &[u8; DIGEST_LEN],
        key: &PrivateKeyDer<'_>,
    ) -> Result<Vec<u8>, SignatureError>;

    /// Check `signature` over `digest` against the public key in `certificate`
    ///
    /// Any failure, including an unparseable certificate or signature,
    /// yields `false`.
    fn verify(
        &self,
        digest: &[u8; DIGEST_LEN],
        certificate: &CertificateDer<'_>,
        signature: &[u8],
    ) -> bool;
}

/// ECDSA over NIST P-256 with SHA-256, DER-encoded signatures
pub struct EcdsaP256Sha256 {
    rng: SystemRandom,
}

impl EcdsaP256Sha256 {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for EcdsaP256Sha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureProvider for EcdsaP256Sha256 {
    fn sign(
        &self,
        digest: &[u8; DIGEST_LEN],
        key: &PrivateKeyDer<'_>,
    ) -> Result<Vec<u8>, SignatureError> {
        let pkcs8 = match key {
            PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der(),
            _ => {
                return Err(SignatureError::SigningFailed(
                    "private key must be PKCS#8 encoded".to_string(),
                ))
            }
        };

        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &self.rng)
            .map_err(|e| SignatureError::SigningFailed(format!("key rejected: {}", e)))?;

        let signature = key_pair
            .sign(&self.rng, digest)
            .map_err(|_| SignatureError::SigningFailed("ECDSA signing failed".to_string()))?;

        Ok(signature.as_ref().to_vec())
    }

    fn verify(
        &self,
        digest: &[u8; DIGEST_LEN],
        certificate: &CertificateDer<'_>,
        signature: &[u8],
    ) -> bool {
        let cert = match webpki::EndEntityCert::try_from(certificate) {
            Ok(cert) => cert,
            Err(e) => {
                debug!("Certificate rejected: {:?}", e);
                return false;
            }
        };

        cert.verify_signature(webpki::ring::ECDSA_P256_SHA256, digest, signature)
            .is_ok()
    }
}

/// File-level signing and verification
#[derive(Clone)]
pub struct SignatureService {
    provider: Arc<dyn SignatureProvider>,
}

impl SignatureService {
    pub fn new(provider: Arc<dyn SignatureProvider>) -> Self {
        Self { provider }
    }

    /// Sign `file` with the PEM private key at `private_key`
    ///
    /// The raw signature bytes are written to `signature_path`, or to
    /// [`default_signature_path`] when none is given, replacing any
    /// existing file. Returns the path written.
    pub async fn sign_file(
        &self,
        file: &Path,
        private_key: &Path,
        signature_path: Option<&Path>,
    ) -> Result<PathBuf, SignatureError> {
        if !is_file(file).await {
            return Err(SignatureError::FileNotFound(file.to_path_buf()));
        }

        let key = load_private_key(private_key)
            .map_err(|e| SignatureError::SigningFailed(format!("{:#}", e)))?;

        let digest = digest_file(file).await?;
        let signature = self.provider.sign(&digest, &key)?;

        let signature_path = signature_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_signature_path(file));
        fs::write(&signature_path, &signature).await?;

        info!(
            "Signed {:?} (sha256 {}) -> {:?}",
            file,
            hex::encode(digest),
            signature_path
        );

        Ok(signature_path)
    }

    /// Verify the detached signature at `signature_path` over `file`
    ///
    /// Returns `Ok(false)` for a bad signature, an unreadable certificate
    /// or a malformed signature. Errors only when an input file is missing.
    pub async fn verify_file(
        &self,
        file: &Path,
        certificate: &Path,
        signature_path: &Path,
    ) -> Result<bool, SignatureError> {
        for path in [file, certificate, signature_path] {
            if !is_file(path).await {
                return Err(SignatureError::FileNotFound(path.to_path_buf()));
            }
        }

        let cert = match load_certs(certificate) {
            Ok(mut certs) => certs.swap_remove(0),
            Err(e) => {
                warn!("Cannot use certificate {:?}: {:#}", certificate, e);
                return Ok(false);
            }
        };

        let signature = fs::read(signature_path).await?;
        let digest = digest_file(file).await?;

        Ok(self.provider.verify(&digest, &cert, &signature))
    }
}

impl Default for SignatureService {
    fn default() -> Self {
        Self::new(Arc::new(EcdsaP256Sha256::new()))
    }
}

/// `report.pdf` -> `report.pdf.sig`
pub fn default_signature_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

/// SHA-256 of a file's content, read in chunks
pub async fn digest_file(path: &Path) -> io::Result<[u8; DIGEST_LEN]> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}
