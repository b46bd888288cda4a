//! Signed File Transfer CLI - Main Entry Point
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CLI Application                      │
//! │    ┌────────────────┐  ┌──────────┐  ┌──────────┐        │
//! │    │ generate-certs │  │  server  │  │  client  │        │
//! │    └────────────────┘  └──────────┘  └──────────┘        │
//! │                            │                             │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  Signature Layer (SHA-256 + ECDSA P-256, ring)     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  Protocol Layer (flag + length-prefixed frames)    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  TLS Layer (rustls) over tokio TCP                 │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use signed_transfer::receiver::DEFAULT_MAX_NAME_LEN;
use signed_transfer::tls::{generate_self_signed_cert, save_cert_and_key};
use signed_transfer::{
    ClientTlsConfig, KeyPaths, Receiver, ReceiverConfig, Sender, SenderConfig, ServerTlsConfig,
};

/// Signed File Transfer CLI
///
/// Sends a single file over TLS, optionally with a detached signature.
#[derive(Parser)]
#[command(name = "sxfer")]
#[command(version)]
#[command(about = "Single-file transfer over TLS with optional signatures", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Certificate and private key locations
#[derive(Args)]
struct KeyArgs {
    /// Certificate (PEM)
    #[arg(long, default_value = "certs/server.crt")]
    cert: PathBuf,

    /// Private key (PEM)
    #[arg(long, default_value = "certs/server.key")]
    key: PathBuf,
}

impl KeyArgs {
    fn paths(&self) -> KeyPaths {
        KeyPaths {
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a self-signed certificate and private key
    GenerateCerts {
        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// DNS names (comma-separated, defaults to the common name)
        #[arg(long)]
        dns: Option<String>,

        /// IP addresses (comma-separated)
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Receive files
    Server {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value_t = 5001)]
        port: u16,

        /// Directory to store received files
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Verify signatures that arrive with a file
        #[arg(long)]
        verify: bool,

        /// Certificate to verify signatures against (defaults to --cert)
        #[arg(long)]
        signer_cert: Option<PathBuf>,

        /// Connections handled at once
        #[arg(long, default_value_t = 1)]
        max_connections: usize,

        /// Seconds a stalled peer may block a read (0 disables)
        #[arg(long, default_value_t = 60)]
        idle_timeout: u64,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Send a file
    Client {
        /// Receiver address
        #[arg(long)]
        host: String,

        /// Receiver port
        #[arg(long)]
        port: u16,

        /// Skip certificate verification (testing only!)
        #[arg(long)]
        insecure: bool,

        /// Attach a detached signature made with --key
        #[arg(long)]
        sign: bool,

        #[command(flatten)]
        keys: KeyArgs,

        /// File to send
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::GenerateCerts {
            cn,
            days,
            dns,
            ip,
            keys,
        } => generate_certs(&cn, days, dns.as_deref(), &ip, &keys.paths()),
        Commands::Server {
            host,
            port,
            out_dir,
            verify,
            signer_cert,
            max_connections,
            idle_timeout,
            keys,
        } => {
            let paths = keys.paths();
            if !paths.exist() {
                info!("No certificate found, generating a self-signed one...");
                generate_certs("localhost", 365, None, "127.0.0.1", &paths)?;
            }

            let config = ReceiverConfig {
                host,
                port,
                out_dir,
                tls_config: ServerTlsConfig::from_files(&paths.cert, &paths.key)?,
                verify_signatures: verify,
                trusted_cert: signer_cert.unwrap_or_else(|| paths.cert.clone()),
                max_connections,
                handshake_timeout: Some(Duration::from_secs(30)),
                idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
                max_name_len: Some(DEFAULT_MAX_NAME_LEN),
            };

            Receiver::new(config).run().await
        }
        Commands::Client {
            host,
            port,
            insecure,
            sign,
            keys,
            file,
        } => {
            let paths = keys.paths();
            let tls_config = if insecure {
                ClientTlsConfig::insecure(&host)?
            } else {
                ClientTlsConfig::new(&paths.cert, &host)?
            };

            let config = SenderConfig {
                host,
                port,
                tls_config,
                signing_key: paths.key,
                io_timeout: Some(Duration::from_secs(30)),
                show_progress: true,
            };

            let report = Sender::new(config).send_file(&file, sign).await?;
            info!("Transfer complete: {} ({} bytes)", report.file_name, report.bytes_sent);
            Ok(())
        }
    }
}

fn generate_certs(
    cn: &str,
    days: u32,
    dns: Option<&str>,
    ip: &str,
    paths: &KeyPaths,
) -> Result<()> {
    let dns_names: Vec<String> = dns
        .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
        .unwrap_or_else(|| vec![cn.to_string()]);
    let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

    let ip_addrs = ip
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpAddr>())
        .collect::<Result<Vec<_>, _>>()?;

    let cert = generate_self_signed_cert(cn, days, &dns_refs, &ip_addrs)?;
    save_cert_and_key(&cert.cert_pem, &cert.key_pem, paths)?;

    info!("Certificate: {:?}", paths.cert);
    info!("Private key: {:?}", paths.key);

    Ok(())
}
