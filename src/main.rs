//! docvault - Encrypted document storage
//!
//! Usage:
//!   docvault init              - Write a default configuration
//!   docvault keygen            - Generate the RSA master keypair
//!   docvault put <file>        - Encrypt and store a document
//!   docvault get <id>          - Decrypt a document
//!   docvault rm <id>           - Delete a document
//!   docvault ls                - List documents

use clap::{Parser, Subcommand};
use docvault::{
    config::Config,
    crypto::generate_pem_pair,
    storage::read_stream,
    DocumentVault, Error, Result,
};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "docvault")]
#[command(author = "docvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted document storage")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/docvault/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and data directories
    Init,

    /// Generate the RSA master keypair
    Keygen {
        /// Directory for private.pem and public.pem (default: <data_dir>/keys)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// RSA modulus size
        #[arg(long, default_value_t = 2048)]
        bits: usize,

        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },

    /// Encrypt and store a document
    Put {
        /// File to upload
        file: PathBuf,

        /// Stored file name (default: the file's own name)
        #[arg(long)]
        name: Option<String>,

        /// MIME type
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Decrypt a document
    Get {
        /// Document id
        id: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a document
    Rm {
        /// Document id
        id: String,
    },

    /// List documents, newest first
    Ls {
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show the effective configuration
    ShowConfig,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config_path),
        Commands::Keygen {
            out_dir,
            bits,
            force,
        } => cmd_keygen(config_path, out_dir, bits, force),
        Commands::Put { file, name, mime } => cmd_put(config_path, &file, name, &mime),
        Commands::Get { id, output } => cmd_get(config_path, &id, output),
        Commands::Rm { id } => cmd_rm(config_path, &id),
        Commands::Ls { page, limit } => cmd_ls(config_path, page, limit),
        Commands::ShowConfig => cmd_show_config(config_path),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id.trim()).map_err(|_| Error::DocumentNotFound(id.to_string()))
}

fn cmd_init(config_path: &Path) -> Result<()> {
    info!("Initializing docvault...");

    let config = Config::from_env()?;
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!("");
    info!("Next steps:");
    info!("  1. Run 'docvault keygen' to create the master keypair");
    info!("  2. Run 'docvault put <file>' to store a document");

    Ok(())
}

fn cmd_keygen(config_path: &Path, out_dir: Option<PathBuf>, bits: usize, force: bool) -> Result<()> {
    let config = Config::load_or_env(config_path)?;
    let (private_path, public_path) = match out_dir {
        Some(dir) => (dir.join("private.pem"), dir.join("public.pem")),
        None => (config.private_key_path(), config.public_key_path()),
    };

    if !force && (private_path.exists() || public_path.exists()) {
        return Err(Error::Configuration(format!(
            "Key files already exist in {:?}; pass --force to replace them",
            private_path.parent().unwrap_or(Path::new("."))
        )));
    }

    info!("Generating RSA-{} master keypair...", bits);
    let pair = generate_pem_pair(bits)?;

    for path in [&private_path, &public_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    write_private_key(&private_path, pair.private_pem.as_bytes())?;
    std::fs::write(&public_path, pair.public_pem.as_bytes())?;

    info!("Private key: {:?}", private_path);
    info!("Public key: {:?}", public_path);
    warn!("Keep the private key secret; losing it makes every stored document unreadable");
    Ok(())
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &[u8]) -> Result<()> {
    std::fs::write(path, pem)?;
    Ok(())
}

fn cmd_put(config_path: &Path, file: &Path, name: Option<String>, mime: &str) -> Result<()> {
    let config = Config::load_or_env(config_path)?;
    let vault = DocumentVault::open(&config)?;

    let file_name = name.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    });

    let runtime = runtime()?;
    let record = runtime.block_on(async {
        let source = tokio::fs::File::open(file).await?;
        let body = read_stream(source, config.limits.read_chunk_size);
        vault.upload(&file_name, mime, body).await
    })?;

    println!("{}", record.id);
    info!("Stored {} ({} bytes) as {}", record.file_name, record.size, record.id);
    Ok(())
}

fn cmd_get(config_path: &Path, id: &str, output: Option<PathBuf>) -> Result<()> {
    let config = Config::load_or_env(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let id = parse_id(id)?;

    let runtime = runtime()?;
    runtime.block_on(async move {
        let (record, mut plaintext) = vault.download(&id).await?;

        match output {
            // Plaintext is only trusted once the stream ends cleanly, so it
            // goes to a side file that is renamed into place afterwards
            Some(path) => {
                let mut partial = path.clone().into_os_string();
                partial.push(".partial");
                let partial = PathBuf::from(partial);

                let mut file = tokio::fs::File::create(&partial).await?;
                let mut result: Result<()> = Ok(());
                while let Some(chunk) = plaintext.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if let Err(e) = file.write_all(&chunk).await {
                                result = Err(e.into());
                                break;
                            }
                        }
                        Err(e) => {
                            result = Err(e);
                            break;
                        }
                    }
                }
                if result.is_ok() {
                    result = file.flush().await.map_err(Error::from);
                }
                drop(file);

                if let Err(e) = result {
                    if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                        warn!("Failed to remove {:?}: {}", partial, cleanup);
                    }
                    return Err(e);
                }
                tokio::fs::rename(&partial, &path).await?;
                info!("Wrote {} to {:?}", record.file_name, path);
            }
            None => {
                let mut stdout = tokio::io::stdout();
                while let Some(chunk) = plaintext.next().await {
                    stdout.write_all(&chunk?).await?;
                }
                stdout.flush().await?;
            }
        }
        Ok::<_, Error>(())
    })
}

fn cmd_rm(config_path: &Path, id: &str) -> Result<()> {
    let config = Config::load_or_env(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let id = parse_id(id)?;

    let runtime = runtime()?;
    let record = runtime.block_on(vault.delete(&id))?;
    info!("Deleted {} ({})", record.id, record.file_name);
    Ok(())
}

fn cmd_ls(config_path: &Path, page: usize, limit: usize) -> Result<()> {
    let config = Config::load_or_env(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let listing = vault.list(page, limit)?;

    println!(
        "Documents (page {} of {}, {} total)",
        listing.page,
        listing.total_pages().max(1),
        listing.total
    );
    println!("{:<36}  {:>10}  {:<20}  Name", "ID", "Size", "Created");
    for doc in &listing.documents {
        println!(
            "{:<36}  {:>10}  {:<20}  {}",
            doc.id,
            doc.size,
            doc.created_at.format("%Y-%m-%d %H:%M:%S"),
            doc.file_name
        );
    }
    Ok(())
}

fn cmd_show_config(config_path: &Path) -> Result<()> {
    let config = Config::load_or_env(config_path)?;

    println!("docvault Configuration");
    println!("======================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Storage root: {:?}", config.storage_root());
    println!("Storage prefix: {}", config.storage.prefix);
    println!("Metadata: {:?}", config.metadata_path());
    println!("Max document size: {} MB", config.limits.max_document_size / 1024 / 1024);

    match config.master_key_source() {
        Ok(source) => {
            println!("Master key: {:?}", source);
            let keys = docvault::crypto::KeyManager::new(source);
            match keys.fingerprint() {
                Ok(fingerprint) => println!("Fingerprint: {}", fingerprint),
                Err(e) => println!("Fingerprint: unavailable - {}", e),
            }
        }
        Err(e) => println!("Master key: NOT CONFIGURED - {}", e),
    }

    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
