//! # cocoschool-chat
//!
//! Terminal client for one conversation or the notification stream.
//!
//! ## Usage
//!
//! ```bash
//! # Follow the notification stream
//! cocoschool-chat
//!
//! # Chat in a conversation; each input line is sent as a message
//! COCOSCHOOL_TOKEN=... COCOSCHOOL_USER_ID=u1 cocoschool-chat ride-42
//! ```
//!
//! Lines starting with `/more` load older history.

use anyhow::Result;
use cocoschool_client::{metrics, Config, Realtime};
use cocoschool_core::{Change, ChannelId, Event, EventBody};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn render(event: &Event) -> String {
    let who = event.sender.as_deref().unwrap_or("?");
    match &event.body {
        EventBody::Message(payload) => {
            format!("[{:?}] {}: {}", event.state, who, payload.content())
        }
        EventBody::Notification(notice) => format!(
            "[{}] {}",
            notice.kind,
            notice.message.as_deref().unwrap_or_default()
        ),
        EventBody::Typing { is_typing } => format!("{who} typing: {is_typing}"),
        EventBody::ReadReceipt { event_ids } => format!("{who} read {}", event_ids.len()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cocoschool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let channel = match std::env::args().nth(1) {
        Some(name) => ChannelId::new(name)?,
        None => ChannelId::notifications(),
    };
    tracing::info!("Opening {} via {}", channel, config.endpoint.ws_url);

    let realtime = Realtime::builder(config).build()?;
    realtime.start();

    let view = realtime.open(channel.clone())?;
    let printer = realtime.subscribe(&channel, |update| match &update.change {
        Change::Appended(event) | Change::Replaced(event) => println!("{}", render(event)),
        Change::Reconciled { event, .. } => println!("{}", render(event)),
        Change::StateChanged { id, state } => println!("  {id} is now {state:?}"),
        Change::Typing { user, is_typing } => {
            if *is_typing {
                println!("  {user} is typing...");
            }
        }
        Change::Read { ids } => println!("  {} read", ids.len()),
        Change::Removed(id) => println!("  {id} removed"),
        Change::Merged { inserted } => println!("  loaded {inserted} older"),
    })?;

    let typing = realtime.typing_debouncer(channel.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/more" {
                    if let Err(e) = view.load_more().await {
                        eprintln!("load failed: {e}");
                    }
                    continue;
                }
                if channel.is_notifications() {
                    eprintln!("notification stream is read-only");
                    continue;
                }
                typing.keystroke();
                let result = view.send_text(line).await;
                typing.stop();
                if let Err(e) = result {
                    eprintln!("send failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    printer.unsubscribe();
    drop(typing);
    drop(view);
    realtime.shutdown().await;

    Ok(())
}
