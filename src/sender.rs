//! Sender
//!
//! Pushes one file, and optionally its detached signature, to a receiver:
//! - Checks the source file before touching the network
//! - Signs the file first when asked to, and refuses to send unsigned
//!   if signing fails
//! - Opens one TLS connection per call and streams the envelope
//!
//! ## Connection Sequence
//!
//! ```text
//! Sender                                    Receiver
//!   |                                          |
//!   |-------- TCP connect ---------------->    |
//!   |======== TLS Handshake ===============    |
//!   |  - receiver certificate checked         |
//!   |    (skipped in insecure mode)           |
//!   |=========================================|
//!   |-------- flag | frame | [frame] ----->    |
//!   |-------- close_notify --------------->    |
//!   |<------- close_notify / FIN -----------   |
//! ```
//!
//! No reply is parsed. A send succeeds when every write and the final
//! shutdown complete without a transport error. The socket is then held
//! open until the receiver hangs up, so closing it early cannot reset a
//! connection the receiver is still draining.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::protocol::{frame_name, FrameHeader, FrameWriter, SignFlag};
use crate::signature::SignatureService;
use crate::tls::ClientTlsConfig;

/// Sender configuration
pub struct SenderConfig {
    /// Receiver host name or IP, also used as the TLS server name
    pub host: String,
    /// Receiver port
    pub port: u16,
    /// TLS configuration
    pub tls_config: ClientTlsConfig,
    /// PEM private key used when signing
    pub signing_key: PathBuf,
    /// Upper bound for TCP connect plus TLS handshake
    pub io_timeout: Option<Duration>,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Name announced in the main frame
    pub file_name: String,
    /// Payload bytes of the main frame
    pub bytes_sent: u64,
    /// Local signature file, when one was produced and sent
    pub signature: Option<PathBuf>,
}

/// Single-file sender
pub struct Sender {
    config: SenderConfig,
    signatures: SignatureService,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            signatures: SignatureService::default(),
        }
    }

    /// Replace the signature service used when signing
    pub fn with_signature_service(mut self, signatures: SignatureService) -> Self {
        self.signatures = signatures;
        self
    }

    /// Send `file_path`, signed if `sign` is set
    ///
    /// Fails with [`TransferError::FileNotFound`] before any side effect
    /// when the path is not a regular file. When signing, the signature
    /// file next to `file_path` is regenerated on every call.
    pub async fn send_file(&self, file_path: &Path, sign: bool) -> Result<SendReport, TransferError> {
        let is_file = fs::metadata(file_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        let file_name = match frame_name(file_path) {
            Some(name) if is_file => name,
            _ => return Err(TransferError::FileNotFound(file_path.to_path_buf())),
        };

        let signature = if sign {
            let path = self
                .signatures
                .sign_file(file_path, &self.config.signing_key, None)
                .await?;
            Some(path)
        } else {
            None
        };

        let mut stream = self.connect().await?;

        let progress = if self.config.show_progress {
            create_progress_bar(0)
        } else {
            ProgressBar::hidden()
        };

        let bytes_sent =
            write_envelope(&mut stream, file_path, signature.as_deref(), &progress).await?;

        progress.finish_and_clear();

        let closed = match self.config.io_timeout {
            Some(limit) => tokio::time::timeout(limit, await_close(&mut stream))
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
            None => await_close(&mut stream).await,
        };
        if let Err(e) = closed {
            debug!("Receiver did not close cleanly: {}", e);
        }

        info!(
            "Sent {} ({} bytes{})",
            file_name,
            bytes_sent,
            if signature.is_some() { ", signed" } else { "" }
        );

        Ok(SendReport {
            file_name,
            bytes_sent,
            signature,
        })
    }

    /// Connect and complete the TLS handshake
    async fn connect(&self) -> Result<TlsStream<TcpStream>, TransferError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to {}...", addr);

        let connector = TlsConnector::from(self.config.tls_config.config.clone());
        let server_name = self.config.tls_config.server_name.clone();

        let handshake = async {
            let tcp_stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
                .await
                .map_err(|source| TransferError::Connect {
                    addr: addr.clone(),
                    source,
                })?;

            debug!("TCP connection established");

            connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(TransferError::TransportHandshake)
        };

        let tls_stream = match self.config.io_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| TransferError::Timeout(limit))??,
            None => handshake.await?,
        };

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }
        info!("TLS connection established with {}", addr);

        Ok(tls_stream)
    }
}

/// Write a complete envelope for `file_path` to `writer`, then shut it down
///
/// The main payload is streamed in bounded chunks. Returns the number of
/// main payload bytes written.
pub async fn write_envelope<W>(
    writer: &mut W,
    file_path: &Path,
    signature_path: Option<&Path>,
    progress: &ProgressBar,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameWriter::new(writer);
    frames
        .write_sign_flag(SignFlag::from(signature_path.is_some()))
        .await?;

    let main_name = frame_name(file_path)
        .ok_or_else(|| TransferError::FileNotFound(file_path.to_path_buf()))?;
    let bytes_sent = write_file_frame(&mut frames, file_path, &main_name, progress).await?;

    if let Some(signature_path) = signature_path {
        let sig_name = frame_name(signature_path)
            .ok_or_else(|| TransferError::FileNotFound(signature_path.to_path_buf()))?;
        let signature = fs::read(signature_path).await?;
        frames.write_frame(&sig_name, &signature).await?;
        debug!("Signature frame {} ({} bytes) written", sig_name, signature.len());
    }

    frames.shutdown().await?;

    Ok(bytes_sent)
}

async fn write_file_frame<W>(
    frames: &mut FrameWriter<W>,
    path: &Path,
    name: &str,
    progress: &ProgressBar,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let file = File::open(path)
        .await
        .map_err(|_| TransferError::FileNotFound(path.to_path_buf()))?;
    // Size taken from the open handle, so header and payload agree
    let size = file.metadata().await?.len();

    frames.write_header(&FrameHeader::new(name, size)).await?;

    progress.set_length(size);
    progress.set_message("Sending");

    let mut reader = BufReader::new(file);
    let sent = frames
        .write_payload_from(&mut reader, size, |n| progress.set_position(n))
        .await?;

    Ok(sent)
}

/// Read and discard until the peer hangs up
///
/// A peer that closes without close_notify counts as closed.
pub async fn await_close<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 1024];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Create progress bar for transfers
fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}
