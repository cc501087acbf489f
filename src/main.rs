//! certgate - certificate normalization and secret store command server
//!
//! `serve` reads one JSON command per line on stdin and answers with one
//! JSON response per line on stdout. Logs always go to stderr.

use anyhow::{bail, Context, Result};
use certgate_auth::{AuthManager, InteractiveLoginError};
use certgate_cert::{
    assemble_bundle, assemble_explicit, classify_format, encode_pkcs12, AssembledChain,
};
use certgate_core::config::{AuthMode, LogFormat};
use certgate_core::sanitize::Sanitizer;
use certgate_core::AppConfig;
use certgate_dispatch::{gateway_client_from_config, store_from_config, Dispatcher};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

/// Normalize certificates into PKCS#12 and manage them in a secret store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the authentication start mode
    #[arg(long, env = "CERTGATE_AUTH_MODE")]
    auth_mode: Option<AuthMode>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Answer JSON commands on stdin, one per line
    Serve,

    /// Print the format of a certificate file
    Detect {
        file: PathBuf,
    },

    /// Build a PKCS#12 file from PEM/DER inputs
    Convert {
        /// Leaf certificate, or a PEM bundle with --bundle
        #[arg(long)]
        cert: PathBuf,

        /// Private key (not needed with --bundle)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Intermediate certificates, in order
        #[arg(long)]
        chain: Vec<PathBuf>,

        /// Treat --cert as a bundle holding certificates and the key
        #[arg(long)]
        bundle: bool,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Export password; also decrypts the key unless --key-password is set
        #[arg(long, env = "CERTGATE_PASSWORD")]
        password: Option<String>,

        /// Passphrase of the private key
        #[arg(long, env = "CERTGATE_KEY_PASSWORD")]
        key_password: Option<String>,
    },

    /// Check and print the authentication status
    AuthStatus,
}

fn init_logging(config: &AppConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.logging.parse_level()?
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_config_builder(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(mode) = args.auth_mode {
        config.auth.mode = mode;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config, args.verbose)?;
    info!("certgate v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Cmd::Serve => serve(config).await,
        Cmd::Detect { file } => detect(&file),
        Cmd::Convert {
            cert,
            key,
            chain,
            bundle,
            out,
            password,
            key_password,
        } => {
            let key_passphrase = key_password.as_deref().or(password.as_deref());
            let assembled = if bundle {
                assemble_bundle(&read(&cert)?, key_passphrase)?
            } else {
                let Some(key) = key else {
                    bail!("--key is required unless --bundle is set");
                };
                let chain = chain.iter().map(|p| read(p)).collect::<Result<Vec<_>>>()?;
                assemble_explicit(&read(&cert)?, &read(&key)?, &chain, key_passphrase)?
            };
            convert(assembled, password.as_deref(), &out)
        }
        Cmd::AuthStatus => {
            let mut auth = start_auth(&config).await;
            let status = auth.check_auth().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Builds the auth manager for the configured mode.
///
/// A failed interactive start is the one fatal condition of the process.
async fn start_auth(config: &AppConfig) -> AuthManager {
    match AuthManager::from_config(&config.auth)
        .start(config.auth.mode)
        .await
    {
        Ok(auth) => auth,
        Err(e) => exit_on_login_failure(e),
    }
}

fn exit_on_login_failure(e: InteractiveLoginError) -> ! {
    error!(error = %e, "Interactive login failed");
    eprintln!("{}", e);
    std::process::exit(1);
}

async fn serve(config: AppConfig) -> Result<()> {
    let auth = start_auth(&config).await;
    let store = store_from_config(&config.store).context("Failed to open secret store")?;
    let gateways =
        gateway_client_from_config(&config.gateway).context("Failed to open gateway backend")?;
    let mut dispatcher = Dispatcher::new(
        auth,
        store,
        gateways,
        Sanitizer::new(config.sanitizer.max_length),
    )
    .with_subscription_id(config.gateway.subscription_id.clone());

    info!("Serving commands on stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatcher.handle_json(&line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    info!("Input closed, shutting down");
    Ok(())
}

fn detect(file: &Path) -> Result<()> {
    let bytes = read(file)?;
    let filename = file.file_name().and_then(|n| n.to_str());
    println!("{}", classify_format(&bytes, filename));
    Ok(())
}

fn convert(assembled: AssembledChain, password: Option<&str>, out: &Path) -> Result<()> {
    let AssembledChain { chain, key } = assembled;
    let container = encode_pkcs12(chain.leaf(), Some(&key), chain.intermediates(), password)?;
    fs::write(out, container.as_bytes())
        .with_context(|| format!("Failed to write {:?}", out))?;

    info!(
        out = %out.display(),
        certificates = chain.len(),
        encrypted = container.is_encrypted(),
        "Wrote PKCS#12 file"
    );
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {:?}", path))
}
