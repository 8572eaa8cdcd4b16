use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    ChannelSession, ChatClient, Credentials, DeliveryStatus, Draft, SessionUpdate, SyncConfig,
    TimelineEntry,
};
use shared::domain::{ChannelId, ChannelKind, LocalId, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const TAIL: usize = 15;

#[derive(Parser, Debug)]
struct Args {
    /// Config file; defaults to ./chat_sync.toml plus CHAT_SYNC__* overrides.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    page_size: Option<u32>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    channel: String,
    /// Treat the channel as a group conversation.
    #[arg(long)]
    group: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::load().context("loading config")?,
    };
    if let Some(server_url) = args.server_url.clone() {
        config.server_url = server_url;
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }

    let client = ChatClient::with_http(config, &args.token)?;
    let connection = client.connect(Credentials::new(args.user_id.as_str(), args.token.as_str()));
    tokio::time::timeout(OPEN_TIMEOUT, connection.wait_until_open())
        .await
        .context("timed out waiting for the socket")??;
    println!("Connected as {}", connection.user_id());

    let kind = if args.group {
        ChannelKind::Group
    } else {
        ChannelKind::Direct
    };
    let session = Arc::new(client.open_channel(ChannelId::new(args.channel.clone()), kind)?);
    let mut updates = session.subscribe_updates();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => report(&session, update).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cli: update stream lagged");
                    print_timeline(&session).await;
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match run_command(&session, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
        }
    }

    session.close();
    client.disconnect();
    Ok(())
}

/// Returns `false` once the user asks to quit.
async fn run_command(session: &Arc<ChannelSession>, line: &str) -> Result<bool> {
    let (command, rest) = match line.strip_prefix('/') {
        Some(command) => command.split_once(' ').unwrap_or((command, "")),
        None => {
            if !line.is_empty() {
                send_in_background(session, Draft::text(line));
            }
            return Ok(true);
        }
    };
    let rest = rest.trim();

    match command {
        "quit" => return Ok(false),
        "older" => {
            let added = session.load_older().await?;
            println!("loaded {added} older messages");
        }
        "edit" => {
            let Some((id, content)) = rest.split_once(' ') else {
                bail!("usage: /edit <message id> <text>");
            };
            session.edit(&MessageId::from(id), content.trim()).await?;
        }
        "delete" => session.delete(&MessageId::from(rest)).await?,
        "retry" => {
            let local_id: LocalId = rest.parse().context("invalid local id")?;
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(err) = session.retry(local_id).await {
                    warn!(error = %err, local_id = %local_id, "cli: retry did not complete");
                }
            });
        }
        "discard" => {
            let local_id: LocalId = rest.parse().context("invalid local id")?;
            session.discard(local_id).await?;
        }
        "show" => print_timeline(session).await,
        other => bail!("unknown command /{other}"),
    }
    Ok(true)
}

/// Sends without blocking the input loop. Delivery failures also arrive as
/// `SessionUpdate::SendFailed`.
fn send_in_background(session: &Arc<ChannelSession>, draft: Draft) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        if let Err(err) = session.send(draft).await {
            warn!(error = %err, "cli: send did not complete");
        }
    });
}

async fn report(session: &ChannelSession, update: SessionUpdate) {
    match update {
        SessionUpdate::TimelineChanged | SessionUpdate::ProfilesResolved => {
            print_timeline(session).await
        }
        SessionUpdate::ChannelChanged => {
            let channel = session.channel().await;
            println!(
                "-- {} ({} members)",
                channel.display_name.as_deref().unwrap_or(channel.id.as_str()),
                channel.participant_ids.len()
            );
        }
        SessionUpdate::SendFailed { local_id, error } => {
            println!("-- send {local_id} failed: {error} (/retry or /discard)")
        }
        SessionUpdate::Connection(state) => println!("-- connection {state:?}"),
        SessionUpdate::Membership(state) => println!("-- membership {state:?}"),
        SessionUpdate::Error(err) => println!("-- error: {err}"),
    }
}

async fn print_timeline(session: &ChannelSession) {
    let entries = session.snapshot().await;
    let skip = entries.len().saturating_sub(TAIL);
    for entry in &entries[skip..] {
        let author = session.display(entry.sender_id()).username;
        let stamp = entry.created_at().format("%H:%M");
        match entry {
            TimelineEntry::Confirmed(message) => {
                let edited = if message.is_edited { " (edited)" } else { "" };
                println!("[{stamp}] {author}: {}{edited}  #{}", message.content, message.id);
            }
            TimelineEntry::Optimistic(pending) => {
                let status = match &pending.status {
                    DeliveryStatus::Pending => "sending".to_owned(),
                    DeliveryStatus::Failed { reason } => format!("failed: {reason}"),
                };
                println!(
                    "[{stamp}] {author}: {}  ({status}, {})",
                    pending.draft.content, pending.local_id
                );
            }
        }
    }
}
