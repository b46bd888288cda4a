//! Protocol Definition Module
//!
//! This module defines the wire format of a single transfer:
//! - The sign flag announcing whether a signature frame follows
//! - Length-prefixed frames carrying a name and a byte payload
//! - Streaming SHA-256 digests used by the signature layer
//! - The policy applied to names supplied by the remote peer
//!
//! ## Protocol Overview
//!
//! The protocol is a one-way upload over TLS. The receiver never answers
//! with a structured payload; the sender's only success signal is that
//! every write completed without a transport error.
//!
//! ```text
//! Sender                                 Receiver
//!   |                                      |
//!   |-- [TLS Handshake] ------------------>|
//!   |<----------------- [TLS Established] -|
//!   |                                      |
//!   |-- SignFlag (0 | 1) ----------------->|
//!   |-- Frame(main file) ----------------->|
//!   |-- Frame(signature)   [flag == 1] --->|
//!   |-- [close_notify] ------------------->|
//! ```
//!
//! ## Wire Format
//!
//! All integers are unsigned big-endian.
//!
//! ```text
//! +----------+-------------+------+----------+-----------+
//! | flag (1) | name_len(4) | name | size (8) | content   |
//! +----------+-------------+------+----------+-----------+
//!            \__________________ frame __________________/
//! ```
//!
//! When the flag is 1 a second frame with the same layout follows.
//!
//! The codec itself imposes no size limit on names or payloads. Callers
//! that accept data from untrusted peers set one through
//! [`FrameReader::with_max_name_len`].

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Chunk size for file transfers (64 KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transfer interrupted: expected {expected} bytes, received {received}")]
    TransferInterrupted { expected: u64, received: u64 },

    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Peer stalled for {0:?}")]
    Timeout(Duration),
}

/// First byte of every transfer envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignFlag {
    /// Only the main frame follows
    Unsigned = 0,
    /// The main frame is followed by a signature frame
    Signed = 1,
}

impl SignFlag {
    /// Parse the flag byte. Anything other than 0 or 1 is a violation.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(SignFlag::Unsigned),
            1 => Ok(SignFlag::Signed),
            other => Err(ProtocolError::Violation(format!(
                "sign flag must be 0 or 1, got {}",
                other
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_signed(self) -> bool {
        self == SignFlag::Signed
    }
}

impl From<bool> for SignFlag {
    fn from(signed: bool) -> Self {
        if signed {
            SignFlag::Signed
        } else {
            SignFlag::Unsigned
        }
    }
}

/// Name and declared payload size of a frame
///
/// Wire format:
/// ```text
/// +-------------+------+----------+
/// | name_len(4) | name | size (8) |
/// +-------------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub name: String,
    pub size: u64,
}

impl FrameHeader {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Encode the header into its wire representation
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name.as_bytes();
        let name_len = u32::try_from(name.len()).map_err(|_| {
            ProtocolError::Violation(format!("name of {} bytes does not fit u32", name.len()))
        })?;

        let mut buf = Vec::with_capacity(4 + name.len() + 8);
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.size.to_be_bytes());
        Ok(buf)
    }
}

/// Encode a complete frame held in memory
pub fn encode_frame(name: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = FrameHeader::new(name, payload.len() as u64).encode()?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reading half of the codec
///
/// Every read blocks until exactly the requested number of bytes has
/// arrived. A stream that ends first yields
/// [`ProtocolError::TransferInterrupted`], never a short frame.
pub struct FrameReader<R> {
    inner: R,
    idle_timeout: Option<Duration>,
    max_name_len: Option<usize>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            idle_timeout: None,
            max_name_len: None,
        }
    }

    /// Fail any single read that makes no progress for `timeout`
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Reject frames that declare a longer name
    pub fn with_max_name_len(mut self, max: Option<usize>) -> Self {
        self.max_name_len = max;
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the one-byte envelope flag
    pub async fn read_sign_flag(&mut self) -> Result<SignFlag, ProtocolError> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).await?;
        SignFlag::from_byte(byte[0])
    }

    /// Read a frame header: name length, name, payload size
    ///
    /// The name is decoded leniently; invalid UTF-8 sequences become
    /// U+FFFD instead of failing the frame.
    pub async fn read_header(&mut self) -> Result<FrameHeader, ProtocolError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let name_len = u32::from_be_bytes(len_buf) as usize;

        if let Some(max) = self.max_name_len {
            if name_len > max {
                return Err(ProtocolError::Violation(format!(
                    "name length {} exceeds limit {}",
                    name_len, max
                )));
            }
        }

        let mut name = vec![0u8; name_len];
        self.read_exact(&mut name).await?;
        let name = String::from_utf8_lossy(&name).into_owned();

        let mut size_buf = [0u8; 8];
        self.read_exact(&mut size_buf).await?;
        let size = u64::from_be_bytes(size_buf);

        Ok(FrameHeader { name, size })
    }

    /// Stream exactly `size` payload bytes into `out`
    pub async fn copy_payload<W>(&mut self, size: u64, out: &mut W) -> Result<u64, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; CHUNK_SIZE.min(size as usize).max(1)];
        let mut remaining = size;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = self.read_some(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(ProtocolError::TransferInterrupted {
                    expected: size,
                    received: size - remaining,
                });
            }
            out.write_all(&buffer[..n]).await?;
            remaining -= n as u64;
        }

        Ok(size)
    }

    /// Read a whole payload into memory
    pub async fn read_payload(&mut self, size: u64) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::new();
        self.copy_payload(size, &mut payload).await?;
        Ok(payload)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::TransferInterrupted {
                    expected: buf.len() as u64,
                    received: filled as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// A single read; an abrupt close counts as end of stream.
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let result = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.inner.read(buf))
                .await
                .map_err(|_| ProtocolError::Timeout(timeout))?,
            None => self.inner.read(buf).await,
        };

        match result {
            Ok(n) => Ok(n),
            // rustls reports a missing close_notify this way
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(ProtocolError::Io(e)),
        }
    }
}

/// Writing half of the codec
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn write_sign_flag(&mut self, flag: SignFlag) -> Result<(), ProtocolError> {
        self.inner.write_u8(flag.as_byte()).await?;
        Ok(())
    }

    pub async fn write_header(&mut self, header: &FrameHeader) -> Result<(), ProtocolError> {
        self.inner.write_all(&header.encode()?).await?;
        Ok(())
    }

    /// Write a frame whose payload is already in memory
    pub async fn write_frame(&mut self, name: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        self.inner.write_all(&encode_frame(name, payload)?).await?;
        Ok(())
    }

    /// Stream exactly `size` bytes from `source` as a frame payload
    ///
    /// `on_progress` receives the running byte count after each chunk.
    pub async fn write_payload_from<S, F>(
        &mut self,
        source: &mut S,
        size: u64,
        mut on_progress: F,
    ) -> Result<u64, ProtocolError>
    where
        S: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;

        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = source.read(&mut buffer[..want]).await?;
            if n == 0 {
                // The header already promised `size` bytes
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {} bytes", sent, size),
                )));
            }
            self.inner.write_all(&buffer[..n]).await?;
            sent += n as u64;
            on_progress(sent);
        }

        Ok(sent)
    }

    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write direction
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Streaming SHA-256 calculator for large files
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> [u8; DIGEST_LEN] {
        self.hasher.finalize().into()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a peer-supplied name into a path relative to the output directory
///
/// Relative subpaths such as `reports/q3.pdf` are allowed and `/` is the
/// only separator, so a backslash stays part of the file name on Unix.
/// Dotfiles such as `.env` are ordinary names. Anything that could escape
/// the output directory is rejected.
///
/// # Security
/// The name arrives from the network. It must pass through here before it
/// is joined onto any local directory.
pub fn sanitize_name(name: &str) -> Result<PathBuf, ProtocolError> {
    let reject = |reason| ProtocolError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(reject("empty name"));
    }

    if name.contains('\0') {
        return Err(reject("contains NUL byte"));
    }

    if name.starts_with('/') {
        return Err(reject("absolute paths not allowed"));
    }

    let mut path = PathBuf::new();
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err(reject("empty path segment"));
        }
        if segment == "." || segment == ".." {
            return Err(reject("path traversal detected"));
        }
        path.push(segment);
    }

    // Catches `\..\` segments, roots and drive prefixes on Windows
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(reject("path must be relative"));
    }

    Ok(path)
}

/// Base file name of a local path, as sent in a frame header
pub fn frame_name(path: &Path) -> Option<String> {
    path.file_name().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let bytes = encode_frame("a.txt", b"hi").unwrap();
        assert_eq!(
            hex::encode(&bytes),
            "00000005612e74787400000000000000026869"
        );
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = encode_frame("x", b"").unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, b'x', 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_sign_flag_values() {
        assert_eq!(SignFlag::from_byte(0).unwrap(), SignFlag::Unsigned);
        assert_eq!(SignFlag::from_byte(1).unwrap(), SignFlag::Signed);
        assert!(matches!(
            SignFlag::from_byte(2),
            Err(ProtocolError::Violation(_))
        ));
        assert!(SignFlag::from(true).is_signed());
        assert_eq!(SignFlag::from(false).as_byte(), 0);
    }

    #[tokio::test]
    async fn test_read_frame() {
        let bytes = encode_frame("dir/notes.md", b"hello world").unwrap();
        let mut reader = FrameReader::new(&bytes[..]);

        let header = reader.read_header().await.unwrap();
        assert_eq!(header, FrameHeader::new("dir/notes.md", 11));

        let payload = reader.read_payload(header.size).await.unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[tokio::test]
    async fn test_read_envelope_with_two_frames() {
        let mut bytes = vec![1u8];
        bytes.extend(encode_frame("f.bin", &[7u8; 100_000]).unwrap());
        bytes.extend(encode_frame("f.bin.sig", b"sig").unwrap());

        let mut reader = FrameReader::new(&bytes[..]);
        assert!(reader.read_sign_flag().await.unwrap().is_signed());

        let main = reader.read_header().await.unwrap();
        let mut sink = Vec::new();
        assert_eq!(reader.copy_payload(main.size, &mut sink).await.unwrap(), 100_000);
        assert!(sink.iter().all(|b| *b == 7));

        let sig = reader.read_header().await.unwrap();
        assert_eq!(sig.name, "f.bin.sig");
        assert_eq!(reader.read_payload(sig.size).await.unwrap(), b"sig");
    }

    #[tokio::test]
    async fn test_lenient_name_decoding() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[b'a', 0xff, b'b']);
        bytes.extend_from_slice(&0u64.to_be_bytes());

        let header = FrameReader::new(&bytes[..]).read_header().await.unwrap();
        assert_eq!(header.name, "a\u{fffd}b");
        assert_eq!(header.size, 0);
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut bytes = FrameHeader::new("big", 10).encode().unwrap();
        bytes.extend_from_slice(b"only4");

        let mut reader = FrameReader::new(&bytes[..]);
        let header = reader.read_header().await.unwrap();
        let err = reader.read_payload(header.size).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TransferInterrupted {
                expected: 10,
                received: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let bytes = [0u8, 0, 0, 9, b'a'];
        let err = FrameReader::new(&bytes[..]).read_header().await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransferInterrupted { .. }));
    }

    #[tokio::test]
    async fn test_name_length_limit() {
        let bytes = encode_frame("abcdef", b"").unwrap();
        let err = FrameReader::new(&bytes[..])
            .with_max_name_len(Some(4))
            .read_header()
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Violation(_)));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_keep_open, quiet) = tokio::io::duplex(64);
        let err = FrameReader::new(quiet)
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .read_sign_flag()
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_writer_matches_encoder() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_sign_flag(SignFlag::Unsigned).await.unwrap();
        writer
            .write_header(&FrameHeader::new("data.bin", 5))
            .await
            .unwrap();
        let mut source: &[u8] = b"12345";
        let mut progress = Vec::new();
        let sent = writer
            .write_payload_from(&mut source, 5, |n| progress.push(n))
            .await
            .unwrap();
        assert_eq!(sent, 5);
        assert_eq!(progress, vec![5]);

        let mut expected = vec![0u8];
        expected.extend(encode_frame("data.bin", b"12345").unwrap());
        assert_eq!(writer.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_writer_rejects_short_source() {
        let mut writer = FrameWriter::new(Vec::new());
        let mut source: &[u8] = b"abc";
        let err = writer
            .write_payload_from(&mut source, 10, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn test_sanitize_name_valid() {
        assert_eq!(sanitize_name("test.txt").unwrap(), PathBuf::from("test.txt"));
        assert!(sanitize_name("a/b/c/d.txt").is_ok());
        assert!(sanitize_name("报告.pdf").is_ok());
        assert_eq!(sanitize_name(".env").unwrap(), PathBuf::from(".env"));
        assert_eq!(
            sanitize_name("config/.bashrc").unwrap(),
            PathBuf::from("config/.bashrc")
        );
        assert_eq!(sanitize_name("..data").unwrap(), PathBuf::from("..data"));
    }

    #[cfg(unix)]
    #[test]
    fn test_sanitize_name_keeps_backslash_on_unix() {
        let path = sanitize_name("a\\b.txt").unwrap();
        assert_eq!(path, PathBuf::from("a\\b.txt"));
        assert_eq!(path.components().count(), 1);
        assert_eq!(
            sanitize_name("..\\up.txt").unwrap(),
            PathBuf::from("..\\up.txt")
        );
    }

    #[cfg(windows)]
    #[test]
    fn test_sanitize_name_windows_separators() {
        assert!(sanitize_name("..\\up.txt").is_err());
        assert!(sanitize_name("\\Windows\\System32").is_err());
        assert!(sanitize_name("C:\\evil.txt").is_err());
    }

    #[test]
    fn test_sanitize_name_traversal() {
        assert!(sanitize_name("../etc/passwd").is_err());
        assert!(sanitize_name("foo/../bar").is_err());
        assert!(sanitize_name("..").is_err());
        assert!(sanitize_name("./a").is_err());
    }

    #[test]
    fn test_sanitize_name_absolute_and_malformed() {
        assert!(sanitize_name("/etc/passwd").is_err());
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("a//b").is_err());
        assert!(sanitize_name("dir/").is_err());
        assert!(sanitize_name("nul\0byte").is_err());
    }

    #[test]
    fn test_streaming_hasher() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"Hello, ");
        hasher.update(b"World!");
        assert_eq!(hasher.bytes_processed(), 13);
        assert_eq!(
            hex::encode(hasher.finalize()),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
