//! `chatsync` commands. `tail` is an interactive line-mode client for one
//! channel at a time; `config` shows what configuration it would run with.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use channel_sync::{
    ChannelId, ChannelSessionController, ConnectionConfig, ConnectionManager, Delivery,
    FileConfig, HttpChatApi, MessageId, Nonce, ScrollOutcome, ServerConfig, SessionConfig,
    SessionError, WsConnector, load_config,
};
use channel_sync::models::{AuthorContext, format_timestamp};

use crate::TailArgs;

/// One line typed at the prompt.
#[derive(Debug, PartialEq)]
enum Input {
    Send(String),
    Older,
    Retry(Nonce),
    Discard(Nonce),
    Switch(ChannelId),
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("older", "") => Input::Older,
        ("retry", nonce) if !nonce.is_empty() => Input::Retry(Nonce::new(nonce)),
        ("discard", nonce) if !nonce.is_empty() => Input::Discard(Nonce::new(nonce)),
        ("switch", channel) if !channel.is_empty() => Input::Switch(ChannelId::new(channel)),
        ("quit", "") | ("q", "") => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

fn read_config(config_path: &Path) -> Result<FileConfig> {
    load_config(config_path)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

pub fn config_command(config_path: &Path) -> Result<()> {
    let file = read_config(config_path)?;
    let rendered = toml::to_string_pretty(&file).context("Failed to render config")?;
    print!("{rendered}");
    Ok(())
}

pub async fn tail_command(config_path: &Path, args: TailArgs) -> Result<()> {
    let file = read_config(config_path)?;
    let server = ServerConfig::from_file(&file.server);
    let connection_config = ConnectionConfig::from_file(&file.connection);
    let session_config = SessionConfig::from_file(&file.session);
    info!(base_url = %server.base_url, "starting chatsync");

    let connection = ConnectionManager::new(
        Arc::new(WsConnector::new(server.clone(), &connection_config)),
        connection_config,
    );
    let controller = ChannelSessionController::new(
        Arc::new(HttpChatApi::new(server)),
        connection.clone(),
        AuthorContext::new(args.author_id, args.author_name),
        session_config,
    );

    let result = run(&controller, ChannelId::new(args.channel)).await;
    controller.unmount();
    connection.close();
    result
}

async fn run(controller: &ChannelSessionController, channel: ChannelId) -> Result<()> {
    let mut renderer = mount(controller, channel).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match parse_input(line) {
            Input::Send(content) => {
                if !controller.compose_enabled() {
                    eprintln!("[chatsync: connecting, message queued]");
                }
                match controller.send_message(&content).await {
                    Ok(accepted) => debug!(nonce = %accepted.nonce, "send accepted"),
                    Err(e) => eprintln!("[chatsync: {e}]"),
                }
            }
            Input::Older => match controller.load_older().await {
                ScrollOutcome::Loaded { added } => eprintln!("[chatsync: {added} older messages]"),
                ScrollOutcome::Exhausted => eprintln!("[chatsync: start of history]"),
                ScrollOutcome::Failed(e) => eprintln!("[chatsync: could not load history: {e}]"),
                ScrollOutcome::Suppressed | ScrollOutcome::Ignored | ScrollOutcome::Discarded => {}
            },
            Input::Retry(nonce) => {
                if let Err(e) = controller.retry_send(&nonce).await {
                    eprintln!("[chatsync: {e}]");
                }
            }
            Input::Discard(nonce) => {
                if let Err(e) = controller.discard_failed(&nonce) {
                    eprintln!("[chatsync: {e}]");
                }
            }
            Input::Switch(channel) => {
                renderer.cancel();
                renderer = match mount(controller, channel).await {
                    Ok(renderer) => renderer,
                    Err(e) => {
                        eprintln!("[chatsync: {e:#}]");
                        CancellationToken::new()
                    }
                };
            }
            Input::Quit => break,
            Input::Unknown(line) => {
                eprintln!("[chatsync: unknown command {line:?}; try /older, /retry <nonce>, /discard <nonce>, /switch <channel>, /quit]");
            }
        }
    }

    renderer.cancel();
    Ok(())
}

/// Mount `channel` and start printing its timeline. Cancel the token to stop printing.
async fn mount(controller: &ChannelSessionController, channel: ChannelId) -> Result<CancellationToken> {
    match controller.mount(channel.clone()).await {
        Ok(()) => {}
        Err(SessionError::ChannelNotFound(id)) => anyhow::bail!("channel {id} does not exist"),
        Err(e) => return Err(e).context("Failed to mount channel"),
    }
    if let Some(e) = controller.load_error() {
        eprintln!("[chatsync: history unavailable: {e}]");
    }
    eprintln!("[chatsync: #{channel}]");

    let cancel = CancellationToken::new();
    tokio::spawn(render(controller.clone(), cancel.clone()));
    Ok(cancel)
}

/// Print each confirmed message once, and each failure once with its retry hint.
async fn render(controller: ChannelSessionController, cancel: CancellationToken) {
    let mut changes = controller.changes();
    let mut shown: HashSet<MessageId> = HashSet::new();
    let mut failures: HashSet<Nonce> = HashSet::new();
    let mut compose = true;

    loop {
        let mut failed_now = HashSet::new();
        for entry in controller.timeline() {
            let m = &entry.message;
            match (&entry.delivery, &m.id, entry.nonce()) {
                (Delivery::Confirmed, Some(id), _) => {
                    if shown.insert(id.clone()) {
                        println!("{} <{}> {}", format_timestamp(&m.created_at), m.author.name, m.content);
                    }
                }
                (Delivery::Failed { reason }, _, Some(nonce)) => {
                    if !failures.contains(nonce) {
                        println!("[failed: {reason}] {} (/retry {nonce} or /discard {nonce})", m.content);
                    }
                    failed_now.insert(nonce.clone());
                }
                _ => {}
            }
        }
        // Forget retried entries so a second failure is reported again.
        failures = failed_now;

        let enabled = controller.compose_enabled();
        if enabled != compose {
            compose = enabled;
            eprintln!(
                "[chatsync: {}]",
                if enabled { "connected" } else { controller.connection_status().label() }
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
