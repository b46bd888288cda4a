//! Receiver
//!
//! This module implements the listening side of a transfer:
//! - Accepts TLS connections, one task per connection
//! - Parses the envelope and persists each frame under the output directory
//! - Optionally verifies the detached signature that came with a file
//!
//! ## Per-connection State Machine
//!
//! ```text
//! AwaitFlag -> ReadMainName -> ReadMainSize -> ReadMainContent
//!     |
//!     +-- flag == 1 --> ReadSigName -> ReadSigSize -> ReadSigContent -> Verify --+
//!     |                                                                          |
//!     +-- flag == 0 -------------------------------------------------------------+--> Closed
//! ```
//!
//! Any failure jumps straight to `Closed`. Failures are logged and
//! contained to their connection; the accept loop keeps running no matter
//! what a client sends.
//!
//! ## Persistence
//!
//! Each payload is streamed into a temporary file next to its
//! destination and renamed into place only once exactly `size` bytes have
//! arrived. A truncated transfer leaves no destination file behind, and two
//! connections writing the same name never interleave: the last complete
//! rename wins.
//!
//! Signature verification is observational. A file whose signature fails
//! to verify is kept, and the result is only logged and reported.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::TransferError;
use crate::protocol::{sanitize_name, FrameReader};
use crate::signature::SignatureService;
use crate::tls::ServerTlsConfig;

/// Longest frame name accepted by default, in bytes
pub const DEFAULT_MAX_NAME_LEN: usize = 4096;

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

/// Receiver configuration
pub struct ReceiverConfig {
    /// Host or IP to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Directory received files are written under
    pub out_dir: PathBuf,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
    /// Verify signatures that arrive with a file
    pub verify_signatures: bool,
    /// Certificate whose public key signatures are checked against
    pub trusted_cert: PathBuf,
    /// Connections processed at once; 1 handles them strictly in order
    pub max_connections: usize,
    /// Upper bound for the TLS handshake
    pub handshake_timeout: Option<Duration>,
    /// Upper bound for any single read that makes no progress
    pub idle_timeout: Option<Duration>,
    /// Longest frame name accepted
    pub max_name_len: Option<usize>,
}

/// A frame persisted to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name as declared by the sender
    pub name: String,
    /// Final location under the output directory
    pub path: PathBuf,
    /// Payload bytes written
    pub size: u64,
}

/// Everything one connection delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedTransfer {
    pub main: ReceivedFile,
    pub signature: Option<ReceivedFile>,
    /// `None` unless a signature arrived and verification is enabled
    pub verified: Option<bool>,
}

/// Outcome of one accepted connection
#[derive(Debug)]
pub struct ConnectionReport {
    pub peer: SocketAddr,
    pub outcome: Result<ReceivedTransfer, TransferError>,
}

/// What a connection handler needs, independent of the transport
#[derive(Clone)]
pub struct ReceiveContext {
    pub out_dir: PathBuf,
    pub verify_signatures: bool,
    pub trusted_cert: PathBuf,
    pub idle_timeout: Option<Duration>,
    pub max_name_len: Option<usize>,
    pub signatures: SignatureService,
}

/// File transfer receiver
pub struct Receiver {
    config: ReceiverConfig,
    signatures: SignatureService,
    reports: Option<mpsc::UnboundedSender<ConnectionReport>>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            signatures: SignatureService::default(),
            reports: None,
        }
    }

    /// Replace the signature service used for verification
    pub fn with_signature_service(mut self, signatures: SignatureService) -> Self {
        self.signatures = signatures;
        self
    }

    /// Send a [`ConnectionReport`] for every finished connection
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<ConnectionReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| format!("Failed to bind to {}:{}", self.config.host, self.config.port))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        fs::create_dir_all(&self.config.out_dir)
            .await
            .with_context(|| format!("Failed to create output directory: {:?}", self.config.out_dir))?;

        if let Ok(addr) = listener.local_addr() {
            info!("Receiver listening on {}", addr);
        }
        info!("Output directory: {:?}", self.config.out_dir);
        if self.config.verify_signatures {
            info!("Verifying signatures against {:?}", self.config.trusted_cert);
        }

        let ctx = Arc::new(ReceiveContext {
            out_dir: self.config.out_dir.clone(),
            verify_signatures: self.config.verify_signatures,
            trusted_cert: self.config.trusted_cert.clone(),
            idle_timeout: self.config.idle_timeout,
            max_name_len: self.config.max_name_len,
            signatures: self.signatures.clone(),
        });
        let acceptor = TlsAcceptor::from(self.config.tls_config.config.clone());
        let handshake_timeout = self.config.handshake_timeout;
        let reports = self.reports.clone();

        accept_loop(listener, self.config.max_connections, move |tcp_stream, peer| {
            let ctx = ctx.clone();
            let acceptor = acceptor.clone();
            let reports = reports.clone();

            async move {
                let outcome =
                    handle_connection(tcp_stream, peer, acceptor, handshake_timeout, &ctx).await;

                match &outcome {
                    Ok(transfer) => debug!("Connection from {} done: {}", peer, transfer.main.name),
                    Err(e) => error!("Connection from {} failed: {}", peer, e),
                }

                if let Some(reports) = reports {
                    let _ = reports.send(ConnectionReport { peer, outcome });
                }
            }
        })
        .await
    }
}

/// Accept connections forever, running `handler` as one task per connection
///
/// At most `max_connections` handlers run at once; further connections
/// wait in the listen backlog until a slot frees up. An accept error is
/// logged and the loop continues.
pub async fn accept_loop<H, Fut>(listener: TcpListener, max_connections: usize, handler: H) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let slots = Arc::new(Semaphore::new(max_connections.max(1)));

    loop {
        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .context("Connection slots closed")?;

        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let task = handler(tcp_stream, peer_addr);
        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
    }
}

/// TLS handshake followed by the envelope for one connection
async fn handle_connection(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    handshake_timeout: Option<Duration>,
    ctx: &ReceiveContext,
) -> Result<ReceivedTransfer, TransferError> {
    info!("New connection from {}", peer_addr);

    let accept = tls_acceptor.accept(tcp_stream);
    let mut tls_stream = match handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, accept)
            .await
            .map_err(|_| TransferError::Timeout(limit))?,
        None => accept.await,
    }
    .map_err(TransferError::TransportHandshake)?;

    debug!("TLS handshake successful with {}", peer_addr);

    let outcome = receive_envelope(&mut tls_stream, ctx).await;

    // close_notify tells the sender everything was consumed
    let shutdown = tls_stream.shutdown();
    let closed = match ctx.idle_timeout {
        Some(limit) => tokio::time::timeout(limit, shutdown)
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
        None => shutdown.await,
    };
    if let Err(e) = closed {
        debug!("TLS shutdown with {} failed: {}", peer_addr, e);
    }

    outcome
}

/// Read one envelope from `stream` and persist it under `ctx.out_dir`
pub async fn receive_envelope<R>(stream: R, ctx: &ReceiveContext) -> Result<ReceivedTransfer, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(stream)
        .with_idle_timeout(ctx.idle_timeout)
        .with_max_name_len(ctx.max_name_len);

    let flag = frames.read_sign_flag().await?;

    let main = receive_frame(&mut frames, &ctx.out_dir).await?;
    info!("Saved {:?} ({} bytes)", main.path, main.size);

    let signature = if flag.is_signed() {
        let signature = receive_frame(&mut frames, &ctx.out_dir).await?;
        info!("Saved signature {:?}", signature.path);
        Some(signature)
    } else {
        None
    };

    let verified = match (&signature, ctx.verify_signatures) {
        (Some(signature), true) => {
            let ok = ctx
                .signatures
                .verify_file(&main.path, &ctx.trusted_cert, &signature.path)
                .await?;
            if ok {
                info!("Signature verification passed: {}", main.name);
            } else {
                warn!("Signature verification FAILED: {}", main.name);
            }
            Some(ok)
        }
        (None, true) => {
            warn!("{} arrived without a signature, nothing to verify", main.name);
            None
        }
        _ => None,
    };

    Ok(ReceivedTransfer {
        main,
        signature,
        verified,
    })
}

/// Read one frame and move its payload into place under `out_dir`
async fn receive_frame<R>(frames: &mut FrameReader<R>, out_dir: &Path) -> Result<ReceivedFile, TransferError>
where
    R: AsyncRead + Unpin,
{
    let header = frames.read_header().await?;
    let relative = sanitize_name(&header.name)?;
    let dest = out_dir.join(&relative);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    debug!("Receiving {} ({} bytes)", header.name, header.size);

    let temp = temp_path(&dest);
    let written = async {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await?;
        let mut writer = BufWriter::new(file);
        frames.copy_payload(header.size, &mut writer).await?;
        writer.flush().await?;
        fs::rename(&temp, &dest).await?;
        Ok::<(), TransferError>(())
    }
    .await;

    if let Err(e) = written {
        // Clean up partial file
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }

    Ok(ReceivedFile {
        name: header.name,
        path: dest,
        size: header.size,
    })
}

/// Sibling of `dest` whose name length does not depend on `dest`
fn temp_path(dest: &Path) -> PathBuf {
    let id = NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed);
    dest.with_file_name(format!(".sxfer-{}-{}.part", std::process::id(), id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, FrameHeader};
    use crate::tls::{generate_self_signed_cert, save_cert_and_key, KeyPaths};

    fn context(out_dir: &Path) -> ReceiveContext {
        ReceiveContext {
            out_dir: out_dir.to_path_buf(),
            verify_signatures: false,
            trusted_cert: out_dir.join("unused.crt"),
            idle_timeout: None,
            max_name_len: Some(DEFAULT_MAX_NAME_LEN),
            signatures: SignatureService::default(),
        }
    }

    fn envelope(flag: u8, frames: &[(&str, &[u8])]) -> Vec<u8> {
        let mut bytes = vec![flag];
        for (name, payload) in frames {
            bytes.extend(encode_frame(name, payload).unwrap());
        }
        bytes
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_receive_unsigned() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(0, &[("hello.txt", b"hello world")]);

        let transfer = receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(transfer.main.path, dir.path().join("hello.txt"));
        assert_eq!(transfer.main.size, 11);
        assert!(transfer.signature.is_none());
        assert_eq!(transfer.verified, None);
        assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"hello world");
        assert_eq!(entries(dir.path()), vec!["hello.txt"]);
    }

    #[tokio::test]
    async fn test_receive_empty_file_into_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(0, &[("nested/deeper/empty.dat", b"")]);

        let transfer = receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(transfer.main.size, 0);
        let saved = dir.path().join("nested/deeper/empty.dat");
        assert!(saved.is_file());
        assert_eq!(std::fs::metadata(saved).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_receive_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old content that is longer").unwrap();

        let bytes = envelope(0, &[("a.txt", b"new")]);
        receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_truncated_transfer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = vec![0u8];
        bytes.extend(FrameHeader::new("partial.bin", 1000).encode().unwrap());
        bytes.extend_from_slice(&[1u8; 400]);

        let err = receive_envelope(&bytes[..], &context(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::TransferInterrupted {
                expected: 1000,
                received: 400
            }
        ));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_frame_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(1, &[("main.txt", b"content")]);

        let err = receive_envelope(&bytes[..], &context(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::TransferInterrupted { .. }));
        // Already flushed main file stays
        assert!(dir.path().join("main.txt").is_file());
    }

    #[tokio::test]
    async fn test_bad_flag_is_violation() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(2, &[("x.txt", b"x")]);

        let err = receive_envelope(&bytes[..], &context(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_traversal_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let bytes = envelope(0, &[("../escape.txt", b"nope")]);

        let err = receive_envelope(&bytes[..], &context(&out)).await.unwrap_err();

        assert!(matches!(err, TransferError::ProtocolViolation(_)));
        assert!(!root.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_receive_signed_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyPaths::in_dir(dir.path().join("keys"));
        let cert = generate_self_signed_cert("localhost", 1, &["localhost"], &[]).unwrap();
        save_cert_and_key(&cert.cert_pem, &cert.key_pem, &keys).unwrap();

        let source = dir.path().join("doc.txt");
        std::fs::write(&source, b"signed payload").unwrap();
        let sig_path = SignatureService::default()
            .sign_file(&source, &keys.key, None)
            .await
            .unwrap();
        let signature = std::fs::read(&sig_path).unwrap();

        let out = dir.path().join("out");
        let mut ctx = context(&out);
        ctx.verify_signatures = true;
        ctx.trusted_cert = keys.cert.clone();

        let signed: &[u8] = b"signed payload";
        let bytes = envelope(1, &[("doc.txt", signed), ("doc.txt.sig", signature.as_slice())]);
        let transfer = receive_envelope(&bytes[..], &ctx).await.unwrap();
        assert_eq!(transfer.verified, Some(true));
        assert_eq!(transfer.signature.unwrap().path, out.join("doc.txt.sig"));

        // Tampered content is kept but reported as unverified
        let tampered: &[u8] = b"tampered payload";
        let bytes = envelope(1, &[("doc.txt", tampered), ("doc.txt.sig", signature.as_slice())]);
        let transfer = receive_envelope(&bytes[..], &ctx).await.unwrap();
        assert_eq!(transfer.verified, Some(false));
        assert_eq!(std::fs::read(out.join("doc.txt")).unwrap(), b"tampered payload");
    }

    #[tokio::test]
    async fn test_signature_kept_when_verification_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(1, &[("f.txt", b"data"), ("f.txt.sig", b"junk")]);

        let transfer = receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(transfer.verified, None);
        assert_eq!(entries(dir.path()), vec!["f.txt", "f.txt.sig"]);
    }

    #[tokio::test]
    async fn test_receive_dotfile() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = envelope(0, &[(".env", b"TOKEN=abc")]);

        let transfer = receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(transfer.main.path, dir.path().join(".env"));
        assert_eq!(std::fs::read(dir.path().join(".env")).unwrap(), b"TOKEN=abc");
        assert_eq!(entries(dir.path()), vec![".env"]);
    }

    #[tokio::test]
    async fn test_receive_longest_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let name = "a".repeat(250);
        let bytes = envelope(0, &[(name.as_str(), b"long")]);

        let transfer = receive_envelope(&bytes[..], &context(dir.path())).await.unwrap();

        assert_eq!(transfer.main.size, 4);
        assert_eq!(std::fs::read(dir.path().join(&name)).unwrap(), b"long");
        assert_eq!(entries(dir.path()), vec![name]);
    }

    #[test]
    fn test_temp_path_is_bounded_sibling() {
        let long = "b".repeat(255);
        let dest = Path::new("/out/dir").join(&long);
        let a = temp_path(&dest);
        let b = temp_path(&dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        assert!(a.file_name().unwrap().len() < 64);
    }
}
