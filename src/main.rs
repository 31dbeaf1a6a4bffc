//! CLI entry point for Enclave.
//!
//! Supports identity generation, peer management, configuration management
//! and running a node that listens for or sends messages.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use enclave::{
    crypto::{self, Fingerprint},
    keystore::PUBLIC_KEY_FILE,
    utils::DEFAULT_CONFIG_FILE,
    Enclave, EnclaveConfig, Keystore, PeerAddress,
};
use log::{info, warn};
use std::path::{Path, PathBuf};
use tokio::signal;

/// Environment variable holding the identity passphrase
const PASSPHRASE_ENV: &str = "ENCLAVE_PASSPHRASE";

/// Enclave - serverless peer-to-peer encrypted messaging
#[derive(Parser)]
#[command(name = "enclave")]
#[command(about = "Serverless peer-to-peer encrypted messaging over TCP")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the identity and peer keys
    #[arg(short, long, value_name = "DIR")]
    keys_dir: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity key pair
    Generate {
        /// Overwrite an existing identity
        #[arg(short, long)]
        force: bool,
    },
    /// Print the local fingerprint
    Fingerprint,
    /// Store a peer public key
    AddPeer {
        /// PEM file containing the peer public key
        pem: PathBuf,
        /// Where to reach the peer (host:port)
        #[arg(short, long)]
        address: Option<String>,
    },
    /// List known peers
    Peers {
        /// Display format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
    /// Listen for incoming messages until interrupted
    Listen {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send a message to a peer at its stored address
    Send {
        /// Recipient fingerprint
        fingerprint: String,
        /// Message text
        message: String,
        /// Always dial a fresh connection
        #[arg(long)]
        no_pool: bool,
    },
    /// Send a message to every peer with a stored address
    Broadcast {
        /// Message text
        message: String,
    },
    /// Generate, show and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EnclaveConfig::load(cli.config.as_deref())?;
    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    if let Some(keys_dir) = cli.keys_dir {
        config.storage.keys_dir = keys_dir;
    }

    match cli.command {
        Commands::Generate { force } => handle_generate(force, &config),
        Commands::Fingerprint => handle_fingerprint(&config),
        Commands::AddPeer { pem, address } => handle_add_peer(&pem, address.as_deref(), &config),
        Commands::Peers { format } => handle_peers(format, &config),
        Commands::Listen { host, port } => handle_listen(host, port, config).await,
        Commands::Send {
            fingerprint,
            message,
            no_pool,
        } => handle_send(&fingerprint, &message, no_pool, config).await,
        Commands::Broadcast { message } => handle_broadcast(&message, config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn passphrase() -> Result<String> {
    std::env::var(PASSPHRASE_ENV)
        .map_err(|_| anyhow!("Set {} to the identity passphrase", PASSPHRASE_ENV))
}

fn keystore(config: &EnclaveConfig) -> Keystore {
    Keystore::with_params(&config.storage.keys_dir, config.crypto.key_params())
}

fn handle_generate(force: bool, config: &EnclaveConfig) -> Result<()> {
    if Enclave::has_identity(config) && !force {
        bail!("Identity already exists. Use --force to overwrite.");
    }

    let passphrase = passphrase()?;
    if passphrase.is_empty() {
        bail!("Refusing to encrypt the private key with an empty passphrase");
    }

    info!(
        "Generating {}-bit identity, this can take a while",
        config.crypto.modulus_bits
    );
    let fingerprint = Enclave::generate_identity(config, &passphrase)?;

    println!("✓ Identity generated");
    println!("Fingerprint: {}", fingerprint);
    println!(
        "Public key:  {}",
        config.storage.keys_dir.join(PUBLIC_KEY_FILE).display()
    );
    Ok(())
}

fn handle_fingerprint(config: &EnclaveConfig) -> Result<()> {
    let path = config.storage.keys_dir.join(PUBLIC_KEY_FILE);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("No identity at {}, generate first", path.display()))?;
    let public_key = crypto::load_public_key(&bytes)?;
    println!("{}", Fingerprint::of(&public_key)?);
    Ok(())
}

fn handle_add_peer(pem: &Path, address: Option<&str>, config: &EnclaveConfig) -> Result<()> {
    let keystore = keystore(config);
    let address = address.map(PeerAddress::parse).transpose()?;

    let fingerprint = keystore.add_peer_from_file(pem)?;
    if let Some(address) = &address {
        keystore.set_peer_address(&fingerprint, address)?;
    }

    println!("✓ Added peer {}", fingerprint);
    if let Some(address) = address {
        println!("  Address: {}", address);
    }
    Ok(())
}

fn handle_peers(format: OutputFormat, config: &EnclaveConfig) -> Result<()> {
    let peers = keystore(config).list_peers()?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&peers)?);
        }
        OutputFormat::Pretty => {
            if peers.is_empty() {
                println!("No peers. Add one with `enclave add-peer <pem>`.");
            }
            for peer in &peers {
                let address = peer
                    .address
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string);
                println!("{}  {}", peer.fingerprint, address);
            }
        }
    }
    Ok(())
}

async fn open(config: EnclaveConfig) -> Result<Enclave> {
    let passphrase = passphrase()?;
    let node = tokio::task::spawn_blocking(move || Enclave::open(config, &passphrase)).await??;
    Ok(node)
}

async fn handle_listen(host: Option<String>, port: Option<u16>, mut config: EnclaveConfig) -> Result<()> {
    if let Some(host) = host {
        config.network.host = host;
    }
    if let Some(port) = port {
        config.network.listen_port = port;
    }

    let node = open(config).await?;
    let report = node.preload_peers().await?;
    info!("Loaded {} of {} peer keys", report.loaded, report.attempted);

    let listener = node
        .listen(|sender: &str, text: &str, timestamp: f64| {
            let when = chrono::DateTime::from_timestamp(timestamp as i64, 0)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!("[{}] {}: {}", when, &sender[..12], text);
        })
        .await?;

    println!("Fingerprint: {}", node.fingerprint());
    println!("Listening on {} (Ctrl-C to stop)", listener.local_addr());

    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    listener.shutdown().await;
    node.shutdown();
    Ok(())
}

async fn handle_send(fingerprint: &str, message: &str, no_pool: bool, config: EnclaveConfig) -> Result<()> {
    let recipient = Fingerprint::parse(fingerprint)?;
    let node = open(config).await?;

    let address = node
        .keystore()
        .peer_address(&recipient)
        .ok_or_else(|| anyhow!("No address stored for {}, use add-peer --address", recipient.short()))?;

    node.send(&address.host, address.port, &recipient, message, !no_pool)
        .await?;
    node.shutdown();

    println!("✓ Sent to {}", recipient.short());
    Ok(())
}

async fn handle_broadcast(message: &str, config: EnclaveConfig) -> Result<()> {
    let node = open(config).await?;
    let report = node.broadcast(message).await?;
    node.shutdown();

    if report.results.is_empty() {
        warn!("No peers with a stored address");
    }
    for (fingerprint, delivered) in &report.results {
        if *delivered {
            println!("✓ {}", fingerprint.short());
        } else if let Some(e) = report.errors.get(fingerprint) {
            println!("✗ {}: {}", fingerprint.short(), e);
        }
    }
    println!(
        "Delivered to {} of {} peers",
        report.succeeded(),
        report.results.len()
    );
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &EnclaveConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            EnclaveConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                EnclaveConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
