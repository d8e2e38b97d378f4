//! hookbus - emit to and follow a running hookbusd
//!
//! ```bash
//! hookbus emit hook.pre_tool_use '{"session_id": "s1", "tool": "Bash"}'
//! hookbus emit --channel /deploy deploy.started
//! hookbus tail --channel /hook --channel /session
//! hookbus history --limit 20
//! ```

use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hookbus_client::{fetch_history, ConnectionPool, Observer, ObserverConfig, ObserverEvent, PoolConfig, DEFAULT_URL};
use hookbus_core::Envelope;

#[derive(Parser, Debug)]
#[command(name = "hookbus", version, about = "Emit to and follow the hookbus event bus")]
struct Cli {
    /// Bus WebSocket URL (or HOOKBUS_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Shorthand for ws://127.0.0.1:<PORT>/ws
    #[arg(short, long, global = true, conflicts_with = "url")]
    port: Option<u16>,

    /// Shared secret, if the bus requires one (or HOOKBUS_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one event
    Emit {
        /// Event type, e.g. `hook.pre_tool_use` or `agent.step`
        event_type: String,

        /// JSON object payload
        payload: Option<String>,

        /// Publish on this channel instead of the one derived from the type
        #[arg(short, long)]
        channel: Option<String>,
    },
    /// Print replayed history, then live events until Ctrl-C
    Tail {
        /// Channel to follow (repeatable); all channels by default
        #[arg(short, long)]
        channel: Vec<String>,

        /// Print raw JSON envelopes
        #[arg(long)]
        json: bool,
    },
    /// Print recent events and exit
    History {
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long)]
        channel: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::from_default_env()
        .add_directive("hookbus_client=warn".parse().unwrap_or_default());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let url = match (cli.url, cli.port) {
        (Some(url), _) => url,
        (None, Some(port)) => format!("ws://127.0.0.1:{port}/ws"),
        (None, None) => std::env::var("HOOKBUS_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
    };
    let token = cli.token.or_else(|| std::env::var("HOOKBUS_TOKEN").ok());

    match cli.command {
        Command::Emit {
            event_type,
            payload,
            channel,
        } => emit(url, token, &event_type, payload.as_deref(), channel.as_deref()).await,
        Command::Tail { channel, json } => tail(url, token, channel, json).await,
        Command::History { limit, channel, json } => {
            let events = fetch_history(&url, token, limit, channel, Duration::from_secs(2))
                .await
                .with_context(|| format!("Failed to fetch history from {url}"))?;
            for event in &events {
                print_event(&event.channel(), event, json);
            }
            Ok(())
        }
    }
}

async fn emit(
    url: String,
    token: Option<String>,
    event_type: &str,
    payload: Option<&str>,
    channel: Option<&str>,
) -> Result<()> {
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON")?,
        None => Value::Object(Default::default()),
    };
    if !payload.is_object() {
        bail!("Payload must be a JSON object");
    }

    let pool = ConnectionPool::new(PoolConfig {
        url: url.clone(),
        token,
        max_retries: 1,
        ..PoolConfig::default()
    })?;
    pool.emit(channel.unwrap_or(""), event_type, payload);

    let stats = tokio::task::spawn_blocking(move || pool.shutdown()).await?;
    if stats.sent == 0 {
        bail!("Event was not delivered to {url}. Is hookbusd running?");
    }
    Ok(())
}

async fn tail(url: String, token: Option<String>, channels: Vec<String>, json: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let observer = Observer::new(
        ObserverConfig {
            url,
            channels: (!channels.is_empty()).then_some(channels),
            token,
            ..ObserverConfig::default()
        },
        tx,
        cancel.clone(),
    );
    let mut task = tokio::spawn(async move { observer.run().await });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                break;
            }
            result = &mut task => {
                return match result {
                    Ok(inner) => inner.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
            }
            event = rx.recv() => match event {
                Some(ObserverEvent::Connected { client_id }) => {
                    eprintln!("-- connected as {client_id}");
                }
                Some(ObserverEvent::History(events)) => {
                    for event in &events {
                        print_event(&event.channel(), event, json);
                    }
                    eprintln!("-- {} replayed, following", events.len());
                }
                Some(ObserverEvent::Event { channel, event }) => print_event(&channel, &event, json),
                Some(ObserverEvent::Disconnected) => eprintln!("-- disconnected, retrying"),
                None => break,
            },
        }
    }

    task.await??;
    Ok(())
}

fn print_event(channel: &str, event: &Envelope, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("unprintable event: {e}"),
        }
        return;
    }

    let session = event.session_id().unwrap_or("-");
    println!(
        "{} {:<12} {:<28} {}",
        event.timestamp,
        channel,
        event.qualified_name(),
        session
    );
}
