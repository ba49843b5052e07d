//! Storegate CLI - Command line interface for the storage gateway.
//!
//! Manages storage sources and their credentials, browses and transfers
//! files, and drives the OAuth consent flow for Drive and OneDrive sources.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storegate_common::{
    Credential, Error, FileEntry, LogicalPath, ProviderKind, SourceId, UserId,
};
use storegate_gateway::{
    FederatedRequest, GatewayConfig, NewSource, OAuthSettings, RequestContext, StorageGateway,
    DEFAULT_PAGE_SIZE,
};
use storegate_storage::{ByteStream, WriteOptions};

#[derive(Parser)]
#[command(name = "storegate")]
#[command(about = "Storegate - One interface over many storage providers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// State directory (default: platform data dir / storegate).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Gateway configuration file (default: <data dir>/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User the commands act for.
    #[arg(short, long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage storage sources.
    #[command(subcommand)]
    Sources(SourceCommand),

    /// List a folder.
    List {
        source: String,

        #[arg(default_value = "/")]
        path: String,

        /// Continue from a cursor printed by a previous call.
        #[arg(long)]
        cursor: Option<String>,

        #[arg(long, default_value_t = 100)]
        page_size: u32,
    },

    /// List the same folder across several sources.
    Federated {
        /// Source ids to query.
        #[arg(required = true)]
        sources: Vec<String>,

        #[arg(short, long, default_value = "/")]
        path: String,
    },

    /// Show metadata for a path.
    Stat { source: String, path: String },

    /// Download a file.
    Get {
        source: String,
        path: String,
        dest: PathBuf,
    },

    /// Upload a file.
    Put {
        source: String,
        file: PathBuf,
        dest: String,

        /// Replace an existing file.
        #[arg(long)]
        overwrite: bool,
    },

    /// Create a folder.
    Mkdir { source: String, path: String },

    /// Delete a file or an empty folder.
    Rm { source: String, path: String },

    /// Move or rename a path.
    Mv {
        source: String,
        from: String,
        to: String,

        #[arg(long)]
        overwrite: bool,
    },

    /// Create a read-only share link.
    Share {
        source: String,
        path: String,

        /// Link lifetime in seconds, where the provider supports expiry.
        #[arg(long, default_value_t = 7 * 24 * 3600)]
        expires_in: u64,
    },

    /// Inspect and abort transfer sessions.
    #[command(subcommand)]
    Transfer(TransferCommand),

    /// OAuth consent for Drive and OneDrive sources.
    #[command(subcommand)]
    Oauth(OAuthCommand),
}

#[derive(Subcommand)]
enum SourceCommand {
    /// Register a source.
    Add {
        id: String,

        /// s3, onedrive, gdrive or memory.
        #[arg(short, long)]
        kind: ProviderKind,

        #[arg(short, long)]
        name: String,

        /// Bucket, drive id or root folder id.
        #[arg(short, long, default_value = "")]
        root: String,

        /// JSON file with provider settings.
        #[arg(long)]
        settings: Option<PathBuf>,

        /// JSON file with the credential (anonymous if omitted).
        #[arg(long)]
        credential: Option<PathBuf>,
    },

    /// List your sources.
    List,

    Rename { id: String, name: String },

    Enable { id: String },

    Disable { id: String },

    /// Remove a source, aborting its transfers.
    Remove { id: String },

    /// Delete a source's stored credential.
    Revoke { id: String },
}

#[derive(Subcommand)]
enum TransferCommand {
    List,
    Status { id: String },
    Abort { id: String },
}

#[derive(Subcommand)]
enum OAuthCommand {
    /// Print (and open) the consent URL for a source.
    Authorize {
        source: String,

        /// Do not launch a browser.
        #[arg(long)]
        no_browser: bool,
    },

    /// Exchange the code from the redirect for the source's credential.
    Exchange { source: String, code: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory; pass --data-dir")?
            .join("storegate"),
    };
    let config_path = cli.config.unwrap_or_else(|| data_dir.join("config.json"));
    let config = GatewayConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let gateway = StorageGateway::open(config, &data_dir)
        .await
        .with_context(|| format!("Failed to open state in {}", data_dir.display()))?;
    let ctx = RequestContext::new(UserId::new(cli.user).context("Invalid user")?);

    match cli.command {
        Commands::Sources(command) => cmd_sources(&gateway, &ctx, command).await,

        Commands::List {
            source,
            path,
            cursor,
            page_size,
        } => cmd_list(&gateway, &ctx, &source, &path, cursor.as_deref(), page_size).await,

        Commands::Federated { sources, path } => {
            cmd_federated(&gateway, &ctx, &sources, &path).await
        }

        Commands::Stat { source, path } => cmd_stat(&gateway, &ctx, &source, &path).await,

        Commands::Get { source, path, dest } => {
            cmd_get(&gateway, &ctx, &source, &path, &dest).await
        }

        Commands::Put {
            source,
            file,
            dest,
            overwrite,
        } => cmd_put(&gateway, &ctx, &source, &file, &dest, overwrite).await,

        Commands::Mkdir { source, path } => {
            let entry = gateway
                .create_folder(&ctx, &source_id(&source)?, &logical(&path)?)
                .await
                .context("Failed to create folder")?;
            println!("Folder created: {}", entry.path);
            Ok(())
        }

        Commands::Rm { source, path } => {
            gateway
                .delete_entry(&ctx, &source_id(&source)?, &logical(&path)?)
                .await
                .context("Failed to delete")?;
            println!("Deleted: {}", path);
            Ok(())
        }

        Commands::Mv {
            source,
            from,
            to,
            overwrite,
        } => {
            let entry = gateway
                .move_entry(
                    &ctx,
                    &source_id(&source)?,
                    &logical(&from)?,
                    &logical(&to)?,
                    overwrite,
                )
                .await
                .context("Failed to move")?;
            println!("Moved to: {}", entry.path);
            Ok(())
        }

        Commands::Share {
            source,
            path,
            expires_in,
        } => {
            let link = gateway
                .share_link(
                    &ctx,
                    &source_id(&source)?,
                    &logical(&path)?,
                    Duration::from_secs(expires_in),
                )
                .await
                .context("Failed to create share link")?;
            println!("{}", link.url);
            match link.expires_at {
                Some(at) => println!("  Expires: {}", at),
                None => println!("  Expires: never"),
            }
            Ok(())
        }

        Commands::Transfer(command) => cmd_transfer(&gateway, &ctx, command).await,

        Commands::Oauth(command) => cmd_oauth(&gateway, &ctx, command).await,
    }
}

fn source_id(id: &str) -> Result<SourceId> {
    SourceId::new(id).with_context(|| format!("Invalid source id: {}", id))
}

fn logical(path: &str) -> Result<LogicalPath> {
    LogicalPath::parse(path).with_context(|| format!("Invalid path: {}", path))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

async fn cmd_sources(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    command: SourceCommand,
) -> Result<()> {
    match command {
        SourceCommand::Add {
            id,
            kind,
            name,
            root,
            settings,
            credential,
        } => {
            let settings = match settings {
                Some(path) => read_json(&path).await?,
                None => serde_json::Value::Null,
            };
            let credential = match credential {
                Some(path) => read_json(&path).await?,
                None => Credential::anonymous(),
            };
            let new_source = NewSource {
                id: source_id(&id)?,
                kind,
                display_name: name,
                root_scope: root,
                settings,
            };

            let source = gateway
                .add_source(ctx, new_source, credential)
                .await
                .context("Failed to add source")?;
            println!("Source added: {} ({})", source.id, source.kind);
            if matches!(kind, ProviderKind::OneDrive | ProviderKind::GoogleDrive) {
                println!("Run `storegate oauth authorize {}` to grant access.", source.id);
            }
        }

        SourceCommand::List => {
            let sources = gateway.list_sources(ctx).await?;
            if sources.is_empty() {
                println!("No sources configured.");
            }
            for source in sources {
                let state = if source.enabled { "enabled" } else { "disabled" };
                println!(
                    "  {:<20} {:<14} {:<9} {}",
                    source.id.as_str(),
                    source.kind.as_str(),
                    state,
                    source.display_name
                );
            }
        }

        SourceCommand::Rename { id, name } => {
            let source = gateway.rename_source(ctx, &source_id(&id)?, name).await?;
            println!("Renamed {} to {}", source.id, source.display_name);
        }

        SourceCommand::Enable { id } => {
            gateway.set_source_enabled(ctx, &source_id(&id)?, true).await?;
            println!("Enabled: {}", id);
        }

        SourceCommand::Disable { id } => {
            gateway.set_source_enabled(ctx, &source_id(&id)?, false).await?;
            println!("Disabled: {}", id);
        }

        SourceCommand::Remove { id } => {
            gateway
                .remove_source(ctx, &source_id(&id)?)
                .await
                .context("Failed to remove source")?;
            println!("Removed: {}", id);
        }

        SourceCommand::Revoke { id } => {
            gateway.revoke_credentials(ctx, &source_id(&id)?).await?;
            println!("Credential revoked: {}", id);
        }
    }
    Ok(())
}

fn print_entry(entry: &FileEntry) {
    if entry.is_folder() {
        println!("  [DIR]  {}/", entry.name);
    } else {
        let size = entry.size.map(|s| format!("{} bytes", s)).unwrap_or_default();
        println!("  [FILE] {} ({})", entry.name, size);
    }
}

async fn cmd_list(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    source: &str,
    path: &str,
    cursor: Option<&str>,
    page_size: u32,
) -> Result<()> {
    let page = gateway
        .list_folder(ctx, &source_id(source)?, &logical(path)?, cursor, page_size)
        .await
        .context("Failed to list folder")?;

    if page.entries.is_empty() {
        println!("Folder is empty.");
    }
    for entry in &page.entries {
        print_entry(entry);
    }
    if let Some(next) = page.next_cursor {
        println!("\nMore entries: --cursor {}", next);
    }
    Ok(())
}

async fn cmd_federated(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    sources: &[String],
    path: &str,
) -> Result<()> {
    let path = logical(path)?;
    let requests = sources
        .iter()
        .map(|s| -> Result<FederatedRequest> {
            Ok(FederatedRequest::new(source_id(s)?, path.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let listing = gateway
        .federated_list(ctx, &requests, DEFAULT_PAGE_SIZE)
        .await?;
    for entry in &listing.entries {
        let source = entry.source_id.as_ref().map(|s| s.as_str()).unwrap_or("?");
        print!("{:<16}", source);
        print_entry(entry);
    }
    for failure in &listing.failures {
        eprintln!("{}: {} ({})", failure.source_id, failure.message, failure.kind);
    }
    Ok(())
}

async fn cmd_stat(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    source: &str,
    path: &str,
) -> Result<()> {
    let entry = gateway
        .stat_entry(ctx, &source_id(source)?, &logical(path)?)
        .await
        .context("Failed to stat")?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn cmd_get(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    source: &str,
    path: &str,
    dest: &Path,
) -> Result<()> {
    info!("Downloading {} to {}", path, dest.display());
    let mut stream = gateway
        .read_file(ctx, &source_id(source)?, &logical(path)?, None)
        .await
        .context("Failed to open file")?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Download interrupted")?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    println!("Downloaded: {} ({} bytes)", dest.display(), written);
    Ok(())
}

async fn cmd_put(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    source: &str,
    file: &Path,
    dest: &str,
    overwrite: bool,
) -> Result<()> {
    info!("Uploading {} as {}", file.display(), dest);
    let handle = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let size = handle.metadata().await?.len();
    let stream: ByteStream =
        Box::pin(ReaderStream::new(handle).map(|chunk| chunk.map_err(Error::Io)));

    let options = if overwrite {
        WriteOptions::overwrite()
    } else {
        WriteOptions::create_new()
    };
    let entry = gateway
        .write_file(ctx, &source_id(source)?, &logical(dest)?, stream, Some(size), &options)
        .await
        .context("Failed to upload")?;

    println!("Uploaded: {} ({} bytes)", entry.path, entry.size.unwrap_or(size));
    Ok(())
}

async fn cmd_transfer(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    command: TransferCommand,
) -> Result<()> {
    match command {
        TransferCommand::List => {
            let transfers = gateway.list_transfers(ctx).await?;
            if transfers.is_empty() {
                println!("No transfers.");
            }
            for status in transfers {
                println!(
                    "  {}  {:?} {:?}  {}  {} parts",
                    status.session_id,
                    status.direction,
                    status.state,
                    status.path,
                    status.committed.len()
                );
            }
        }

        TransferCommand::Status { id } => {
            let status = gateway.upload_status(ctx, &id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        TransferCommand::Abort { id } => {
            gateway
                .abort_upload(ctx, &id)
                .await
                .context("Failed to abort transfer")?;
            println!("Aborted: {}", id);
        }
    }
    Ok(())
}

async fn cmd_oauth(
    gateway: &StorageGateway,
    ctx: &RequestContext,
    command: OAuthCommand,
) -> Result<()> {
    match command {
        OAuthCommand::Authorize { source, no_browser } => {
            let source = gateway.get_source(ctx, &source_id(&source)?).await?;
            let client = OAuthSettings::from_settings(&source.settings)?.client(source.kind)?;
            let (url, state) = client.authorization_url();

            println!("Open this URL to grant access:\n\n  {}\n", url);
            println!("State: {}", state);
            if !no_browser {
                if let Err(e) = open::that(&url) {
                    warn!("Could not launch a browser: {}", e);
                }
            }
            println!("Then run: storegate oauth exchange {} <code>", source.id);
        }

        OAuthCommand::Exchange { source, code } => {
            let source = gateway.get_source(ctx, &source_id(&source)?).await?;
            let client = OAuthSettings::from_settings(&source.settings)?.client(source.kind)?;
            let credential = client
                .exchange_code(&code)
                .await
                .context("Code exchange failed")?;
            gateway
                .update_credential(ctx, &source.id, credential)
                .await
                .context("Failed to store credential")?;
            println!("Access granted for {}", source.id);
        }
    }
    Ok(())
}
