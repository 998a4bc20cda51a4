use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use workspace_sync::config::AppConfig;
use workspace_sync::logging::{init_logging, OperationTimer};
use workspace_sync::models::{ChannelFilter, ChannelKind};
use workspace_sync::remote::RestRemote;
use workspace_sync::state::WriteStatus;
use workspace_sync::store::LocalStore;
use workspace_sync::sync::{SyncSettings, WorkspaceSync};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List workspaces
    Workspaces,
    /// List the channels of a workspace, honouring the saved filter
    Channels {
        /// Workspace id
        #[arg(short, long)]
        workspace: String,
    },
    /// Show the messages of a channel
    Messages {
        /// Channel id
        #[arg(short, long)]
        channel: String,

        /// Only show what the local cache holds
        #[arg(long)]
        cached: bool,
    },
    /// Send a message
    Send {
        /// Channel id
        #[arg(short, long)]
        channel: String,

        /// Message text
        #[arg(short, long, default_value = "")]
        text: String,

        /// Attachment as a JSON object; may be repeated
        #[arg(short, long)]
        attachment: Vec<String>,
    },
    /// Fetch a channel from the backend now
    Sync {
        /// Channel id
        #[arg(short, long)]
        channel: String,
    },
    /// Show or change the saved channel filter
    Prefs {
        /// all, favorites, kind:<public|private|direct> or group:<id>
        #[arg(short, long)]
        filter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize logging; the guard keeps the file writer alive
    let log_level = config.get_log_level();
    let log_file = config.logging.file_path.as_ref().map(PathBuf::from);
    let _guard = init_logging(
        Some(log_level.as_str()),
        log_file.as_deref(),
        &config.logging.format,
    )?;

    info!("Starting workspace-sync");

    let cli = Cli::parse();

    let store = LocalStore::from_config(&config.store).context("Failed to open local store")?;
    let remote = RestRemote::new(&config.remote).context("Failed to build remote client")?;
    let sync = WorkspaceSync::new(store, Arc::new(remote), SyncSettings::from_config(&config));

    match cli.command {
        Commands::Workspaces => {
            sync.load_workspaces().wait().await;
            print_json(&sync.snapshot().workspaces)?;
        },
        Commands::Channels { workspace } => {
            sync.select_workspace(Some(workspace.as_str())).wait().await;
            let snapshot = sync.snapshot();
            print_json(&snapshot.visible_channels())?;
        },
        Commands::Messages { channel, cached } => {
            if cached {
                sync.load_messages_local(&channel);
            } else {
                sync.select_channel(Some(channel.as_str())).wait().await;
            }
            let snapshot = sync.snapshot();
            let messages = snapshot.messages.get(&channel).cloned().unwrap_or_default();
            if snapshot.from_cache.contains(&channel) && !cached {
                warn!(channel_id = %channel, "Backend unreachable; showing cached messages");
            }
            print_json(&messages)?;
        },
        Commands::Send {
            channel,
            text,
            attachment,
        } => {
            let attachments = attachment
                .iter()
                .map(|raw| serde_json::from_str(raw))
                .collect::<Result<Vec<serde_json::Value>, _>>()
                .context("Attachments must be JSON objects")?;
            let message = sync.send_message(&channel, &text, &attachments).await?;

            let snapshot = sync.snapshot();
            if let Some(write) = snapshot.writes.iter().find(|w| w.target_id == message.id) {
                if write.status == WriteStatus::Failed {
                    warn!(message_id = %message.id, "Message kept locally; backend did not accept it");
                }
            }
            print_json(&message)?;
        },
        Commands::Sync { channel } => {
            let timer = OperationTimer::new("cli_sync");
            let messages = sync
                .sync_messages(&channel)
                .await
                .with_context(|| format!("Failed to sync channel {channel}"))?;
            timer.finish();
            info!(channel_id = %channel, count = messages.len(), "Channel synced");
            print_json(&messages)?;
        },
        Commands::Prefs { filter } => {
            if let Some(filter) = filter {
                sync.set_channel_filter(parse_filter(&filter)?);
            }
            print_json(&sync.snapshot().preferences)?;
        },
    }

    sync.flush().context("Failed to flush local store")?;
    Ok(())
}

fn parse_filter(raw: &str) -> Result<ChannelFilter> {
    let filter = match raw.split_once(':') {
        None if raw == "all" => ChannelFilter::All,
        None if raw == "favorites" => ChannelFilter::Favorites,
        Some(("kind", kind)) => match ChannelKind::parse(kind) {
            Some(kind) => ChannelFilter::Kind(kind),
            None => bail!("Unknown channel kind: {kind}"),
        },
        Some(("group", group)) if !group.is_empty() => ChannelFilter::Group(group.to_string()),
        _ => bail!("Invalid filter: {raw}. Use all, favorites, kind:<kind> or group:<id>"),
    };
    Ok(filter)
}

#[allow(clippy::print_stdout)]
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
