//! Signed File Transfer
//!
//! Moves a single file from one host to another over TLS, optionally with
//! a detached ECDSA signature the receiver can verify.
//!
//! ## Features
//! - TLS 1.2/1.3 encrypted connections (rustls)
//! - Length-prefixed binary framing, streamed in bounded chunks
//! - Detached SHA-256 / ECDSA P-256 file signatures
//! - Self-signed certificate generation
//!
//! ## Usage
//!
//! ```bash
//! # Generate certificate and key
//! sxfer generate-certs --cn localhost
//!
//! # Start receiver, verifying signatures
//! sxfer server --port 5001 --out-dir ./inbox --verify
//!
//! # Send a signed file
//! sxfer client --host localhost --port 5001 --sign report.pdf
//! ```

pub mod error;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod signature;
pub mod tls;

pub use error::TransferError;
pub use protocol::{FrameHeader, FrameReader, FrameWriter, ProtocolError, SignFlag};
pub use receiver::{ConnectionReport, ReceivedTransfer, Receiver, ReceiverConfig};
pub use sender::{SendReport, Sender, SenderConfig};
pub use signature::{EcdsaP256Sha256, SignatureError, SignatureProvider, SignatureService};
pub use tls::{ClientTlsConfig, KeyPaths, ServerTlsConfig};
