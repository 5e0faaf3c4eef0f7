//! Torshare - peer-to-peer file transfer over Tor

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use torshare_client::config::{expand_path, Config};
use torshare_client::history::{Direction, TransferHistory, TransferRecord};
use torshare_client::{ConnectionListener, Receiver, Sender};
use torshare_core::transport::direct::DirectTransport;
use torshare_core::{crypto, format_size, FileMetadata, TorTransport, TransportProvider};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Suffix given to encrypted containers
const ENCRYPTED_SUFFIX: &str = ".encrypted";

#[derive(Parser)]
#[command(name = "torshare")]
#[command(about = "Peer-to-peer file transfer over Tor", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.torshare/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Connect directly over TCP instead of through Tor (for local testing)
    #[arg(long)]
    direct: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and directories
    Init,

    /// Make sure the Tor proxy is running, starting it if configured
    StartTor,

    /// Send a file to a receiver
    Send {
        /// File to send
        file: PathBuf,

        /// Receiver address (usually a .onion name)
        address: String,

        /// Receiver port
        #[arg(default_value = "8080")]
        port: u16,

        /// Encrypt with this password before sending
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Receive files until interrupted
    Receive {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory for received files (overrides config)
        #[arg(short, long)]
        download_dir: Option<String>,
    },

    /// Decrypt a received file
    Decrypt {
        /// Encrypted container
        file: PathBuf,

        /// Password used when sending
        password: String,

        /// Output path (defaults to the input without .encrypted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the SHA-256 checksum of a file
    Checksum {
        file: PathBuf,
    },

    /// Ask Tor for a new circuit
    Renew,

    /// Show recent transfers
    History {
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Init => {
            init_config(&config_path, &config)?;
        }
        Commands::StartTor => {
            start_tor(&config).await?;
        }
        Commands::Send { file, address, port, password } => {
            if cli.direct {
                let transport = DirectTransport::new(config.connect_timeout());
                send_file(&transport, &config, &file, &address, port, password.as_deref()).await?;
            } else {
                let transport = TorTransport::new(config.tor_config());
                send_file(&transport, &config, &file, &address, port, password.as_deref()).await?;
            }
        }
        Commands::Receive { port, download_dir } => {
            receive_files(&config, port, download_dir.as_deref(), cli.direct).await?;
        }
        Commands::Decrypt { file, password, output } => {
            decrypt_file(&file, &password, output).await?;
        }
        Commands::Checksum { file } => {
            let sum = checksum(&file).await?;
            println!("{}  {}", sum, file.display());
        }
        Commands::Renew => {
            let transport = TorTransport::new(config.tor_config());
            transport.renew_circuit().await?;
            println!("New Tor circuit requested");
        }
        Commands::History { limit } => {
            show_history(&config, limit)?;
        }
    }

    Ok(())
}

fn init_config(config_path: &Path, config: &Config) -> Result<()> {
    let data_dir = config.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!("Created data directory: {}", data_dir.display());
    }
    std::fs::create_dir_all(config.download_dir())?;

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    config.save(config_path)?;
    println!("Initialized Torshare at: {}", data_dir.display());
    println!("Config written to: {}", config_path.display());

    Ok(())
}

async fn start_tor(config: &Config) -> Result<()> {
    let transport = TorTransport::new(config.tor_config());
    transport.ensure_ready(config.ready_timeout()).await?;

    println!(
        "Tor SOCKS proxy ready at {}:{}",
        config.tor.socks_host, config.tor.socks_port
    );

    if transport.owns_process().await {
        // Our Tor child dies with us
        println!("Press Ctrl-C to stop Tor");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

async fn send_file<T: TransportProvider>(
    transport: &T,
    config: &Config,
    file: &Path,
    address: &str,
    port: u16,
    password: Option<&str>,
) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }

    transport.ensure_ready(config.ready_timeout()).await?;

    // With a password, the container is what travels
    let container = match password {
        Some(password) => {
            let container = encrypted_container_path(file)?;

            tracing::info!("Encrypting {}", file.display());
            let (input, output, password) =
                (file.to_path_buf(), container.clone(), password.to_string());
            tokio::task::spawn_blocking(move || crypto::encrypt_file(&input, &output, &password))
                .await??;
            Some(container)
        }
        None => None,
    };
    let source = container.as_deref().unwrap_or(file);

    let sender = Sender::new(transport, config.transfer.chunk_size, config.io_timeout())?;
    let result = sender
        .send_file(source, address, port, container.is_some(), |sent, total| {
            tracing::info!("Sent {} / {}", format_size(sent), format_size(total));
        })
        .await;

    if let Some(container) = &container {
        if let Err(e) = std::fs::remove_file(container) {
            tracing::warn!("Failed to remove {}: {}", container.display(), e);
        }
    }

    let report = result?;
    println!(
        "Sent {} ({}) in {:.1?}, {}/s",
        report.metadata.filename(),
        format_size(report.metadata.filesize()),
        report.elapsed,
        format_size(report.bytes_per_sec() as u64)
    );
    if report.metadata.encrypted() {
        println!("The receiver needs the password to decrypt it");
    }

    record_transfer(config, Direction::Sent, &report.metadata, format!("{}:{}", address, port));
    Ok(())
}

/// `<file>.encrypted`, refusing to clobber an existing file there
fn encrypted_container_path(file: &Path) -> Result<PathBuf> {
    let mut name = file.as_os_str().to_owned();
    name.push(ENCRYPTED_SUFFIX);
    let container = PathBuf::from(name);
    if container.exists() {
        anyhow::bail!(
            "{} already exists; move it aside before sending with a password",
            container.display()
        );
    }
    Ok(container)
}

async fn receive_files(
    config: &Config,
    port: Option<u16>,
    download_dir: Option<&str>,
    direct: bool,
) -> Result<()> {
    // Held until the listener stops so a Tor we launched keeps running
    let _tor = if direct {
        None
    } else {
        let transport = TorTransport::new(config.tor_config());
        transport.ensure_ready(config.ready_timeout()).await?;
        Some(transport)
    };

    let download_dir = download_dir
        .map(expand_path)
        .unwrap_or_else(|| config.download_dir());
    std::fs::create_dir_all(&download_dir)?;
    let port = port.unwrap_or(config.receive.port);

    let history = open_history(config).map(Mutex::new).map(Arc::new);
    let receiver = Receiver::new(&download_dir, config.io_timeout()).on_received(Arc::new(
        move |path: &Path, metadata: &FileMetadata| {
            println!(
                "Received {} ({}) -> {}",
                metadata.filename(),
                format_size(metadata.filesize()),
                path.display()
            );
            if metadata.encrypted() {
                println!("  Encrypted: run `torshare decrypt {} <password>`", path.display());
            }

            if let Some(history) = &history {
                let history = history.lock().unwrap_or_else(|e| e.into_inner());
                let record = TransferRecord::now(Direction::Received, metadata, path.display().to_string());
                if let Err(e) = history.record(&record) {
                    tracing::warn!("Failed to record transfer: {}", e);
                }
            }
        },
    ));

    let listener =
        ConnectionListener::bind(("0.0.0.0", port), receiver, config.transfer.max_sessions).await?;
    println!("Receiving on port {} into {}", port, download_dir.display());
    println!("Point a Tor hidden service at this port to accept transfers. Ctrl-C to stop.");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
            }
            cancel.cancel();
        }
    });

    listener.run(cancel).await?;
    Ok(())
}

async fn decrypt_file(file: &Path, password: &str, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| default_decrypt_output(file));
    if output == file {
        anyhow::bail!("Output would overwrite the input; pass --output");
    }

    let (input, out, password) = (file.to_path_buf(), output.clone(), password.to_string());
    tokio::task::spawn_blocking(move || crypto::decrypt_file(&input, &out, &password))
        .await?
        .context("Decryption failed (wrong password or corrupt file?)")?;

    let sum = checksum(&output).await?;
    println!("Decrypted to {}", output.display());
    println!("SHA-256: {}", sum);
    Ok(())
}

/// `x.encrypted` becomes `x`; anything else gets `.decrypted` appended
fn default_decrypt_output(file: &Path) -> PathBuf {
    let name = file.as_os_str().to_string_lossy();
    match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => PathBuf::from(stripped),
        _ => PathBuf::from(format!("{}.decrypted", name)),
    }
}

async fn checksum(file: &Path) -> Result<String> {
    let path = file.to_path_buf();
    Ok(tokio::task::spawn_blocking(move || crypto::checksum(&path)).await??)
}

fn show_history(config: &Config, limit: u32) -> Result<()> {
    let history = TransferHistory::open(&history_path(config))?;
    let records = history.list(limit)?;
    if records.is_empty() {
        println!("No transfers recorded yet.");
        return Ok(());
    }
    println!("Showing {} of {} transfers", records.len(), history.count()?);

    for record in records {
        println!(
            "{} {:<8} {} ({}){} {}",
            record.timestamp,
            record.direction,
            record.filename,
            format_size(record.filesize),
            if record.encrypted { " [encrypted]" } else { "" },
            record.peer
        );
    }
    Ok(())
}

fn history_path(config: &Config) -> PathBuf {
    config.data_dir().join("history.db")
}

fn open_history(config: &Config) -> Option<TransferHistory> {
    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::warn!("Transfer history disabled: {}", e);
        return None;
    }
    match TransferHistory::open(&history_path(config)) {
        Ok(history) => Some(history),
        Err(e) => {
            tracing::warn!("Transfer history disabled: {}", e);
            None
        }
    }
}

fn record_transfer(config: &Config, direction: Direction, metadata: &FileMetadata, peer: String) {
    if let Some(history) = open_history(config) {
        if let Err(e) = history.record(&TransferRecord::now(direction, metadata, peer)) {
            tracing::warn!("Failed to record transfer: {}", e);
        }
    }
}
