use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::error;

use eport_signer::{
    CertificateStore, SignMethod, SignatureClient, SignerBridge, SignerConfig,
    config::DEFAULT_WS_URL,
};

#[derive(Parser)]
#[command(name = "eport-signer", version, about = "Drive a customs U-Key over its local websocket")]
struct Args {
    #[clap(long, env = "EPORT_WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,
    #[clap(long, env = "EPORT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// PEM certificate used for with-hash signatures
    #[clap(long, env = "EPORT_CERT_PATH")]
    cert_path: Option<PathBuf>,
    #[clap(long, env = "EPORT_BOOTSTRAP_TIMEOUT_MS", default_value = "3000")]
    bootstrap_timeout_ms: u64,
    #[clap(long, env = "EPORT_CALL_TIMEOUT_MS", default_value = "10000")]
    call_timeout_ms: u64,
    #[clap(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, run the certificate bootstrap and report what was loaded
    Probe,
    /// Have the key compute the SHA-1 digest of the source
    Digest {
        /// Source file, stdin when omitted
        source: Option<PathBuf>,
    },
    /// Sign the source
    Sign {
        source: Option<PathBuf>,
        /// Let the key hash the source instead of signing a local digest
        #[clap(long)]
        with_hash: bool,
    },
    /// Verify a signature over the source's digest
    Verify {
        source: Option<PathBuf>,
        #[clap(long)]
        signature: String,
        /// Certificate body to verify with, the key's own when omitted
        #[clap(long)]
        certificate: Option<String>,
    },
}

impl Args {
    fn config(&self) -> SignerConfig {
        SignerConfig {
            ws_url: self.ws_url.clone(),
            password: self.password.clone(),
            cert_path: self.cert_path.clone(),
            bootstrap_timeout: Duration::from_millis(self.bootstrap_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("eport_signer=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eport_signer=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.config();

    let store = Arc::new(CertificateStore::new());
    if let Some(path) = &config.cert_path {
        store
            .load_bundled(path)
            .with_context(|| format!("loading {}", path.display()))?;
    }

    let bridge = Arc::new(SignerBridge::connect(&config, Arc::clone(&store)).await?);
    let client = SignatureClient::from_config(Arc::clone(&bridge), &config);

    match args.command {
        Command::Probe => {
            println!("state: {:?}", bridge.state());
            for kind in [SignMethod::WithHash, SignMethod::WithoutHash] {
                match store.get(kind) {
                    Some(body) => println!("{kind}: {} base64 chars", body.len()),
                    None => println!("{kind}: missing"),
                }
            }
        }
        Command::Digest { source } => {
            let source = read_source(source).await?;
            println!("{}", client.digest(&source).await?);
        }
        Command::Sign { source, with_hash } => {
            let source = read_source(source).await?;
            let signature = if with_hash {
                client.sign_with_hash(&source).await?
            } else {
                client.sign_no_hash(&source).await?
            };
            println!("{}", signature.value);
        }
        Command::Verify {
            source,
            signature,
            certificate,
        } => {
            let source = read_source(source).await?;
            let valid = client
                .verify_no_hash(&source, &signature, certificate.as_deref())
                .await?;
            println!("{}", if valid { "valid" } else { "invalid" });
        }
    }

    bridge.shutdown();
    Ok(())
}

async fn read_source(path: Option<PathBuf>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("reading stdin")?;
            Ok(source)
        }
    }
}
