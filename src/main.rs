use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use floodit::relay::{DEFAULT_HUB_K, DEFAULT_HUB_PORT, DEFAULT_HUB_R};
use floodit::{
    BroadcastConfig, BroadcastEvent, CausalBroadcast, HubConfig, Node, PeerAddr, RelayGroup,
    RelayHub,
};

#[derive(Parser, Debug)]
#[command(name = "floodit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a mesh peer; stdin lines are broadcast to the group.
    Peer(PeerArgs),
    /// Run a relay hub.
    Hub(HubArgs),
    /// Join a document on a relay hub; stdin lines are broadcast to it.
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    local_address: String,

    local_port: String,

    /// Address of a peer already in the group.
    #[arg(short = 'a', long, requires = "remote_port")]
    remote_address: Option<String>,

    #[arg(short = 'p', long, requires = "remote_address")]
    remote_port: Option<String>,

    /// Expected group size, used when founding a group.
    #[arg(short, long, default_value_t = DEFAULT_HUB_R)]
    r: u64,

    /// Clock slots per peer, used when founding a group.
    #[arg(short, long, default_value_t = DEFAULT_HUB_K)]
    k: usize,

    #[arg(short, long, default_value = "30")]
    telemetry_interval: u64,
}

#[derive(Args, Debug)]
struct HubArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_HUB_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = DEFAULT_HUB_R)]
    r: u64,

    #[arg(short, long, default_value_t = DEFAULT_HUB_K)]
    k: usize,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Hub address as HOST:PORT.
    hub: PeerAddr,

    #[arg(short, long)]
    name: String,

    #[arg(short, long)]
    document: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Peer(args) => run_peer(args).await,
        Command::Hub(args) => run_hub(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let local = PeerAddr::checked(&args.local_address, &args.local_port)?;
    let remote = match (&args.remote_address, &args.remote_port) {
        (Some(host), Some(port)) => Some(PeerAddr::checked(host, port)?),
        _ => None,
    };

    let node = Node::bind(&local).await?;

    let (group, events) = match &remote {
        Some(contact) => {
            if let Err(e) = node.bootstrap(contact).await {
                warn!(error = %e, "bootstrap failed");
            }
            node.join_group(contact).await?
        }
        None => node.found_group(args.r, args.k).await?,
    };

    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let node_ref = &node;
    let snapshot = move || async move {
        let view = node_ref.view().await;
        let links = node_ref.peers().await;
        info!(view = view.len(), links = links.len(), "telemetry snapshot");
    };
    let result = drive(&group, events, snapshot, &mut telemetry).await;

    node.shutdown().await;
    result
}

async fn run_hub(args: HubArgs) -> Result<()> {
    let config = HubConfig {
        r: args.r,
        k: args.k,
        ..Default::default()
    };
    let hub = RelayHub::bind(&PeerAddr::new(args.host, args.port), config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal, exiting gracefully");
    hub.shutdown().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let relay = RelayGroup::connect(&args.hub, args.name, args.document).await?;
    let (group, events) = CausalBroadcast::spawn(Arc::new(relay), BroadcastConfig::default()).await?;

    let mut telemetry = time::interval(Duration::from_secs(300));
    let result = drive(&group, events, || async {}, &mut telemetry).await;
    let _ = group.quit().await;
    result
}

/// Broadcasts stdin lines and prints deliveries until ctrl-c, end of input
/// or a failed join.
async fn drive<F, Fut>(
    group: &CausalBroadcast,
    mut events: mpsc::Receiver<BroadcastEvent>,
    mut on_tick: F,
    interval: &mut time::Interval,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    // Publishing waits on the actor, which may be waiting on `events`.
    let mut publisher = tokio::spawn(publish_stdin(group.clone()));

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break Ok(());
            }
            done = &mut publisher => {
                break done.context("stdin task failed").and_then(|r| r);
            }
            event = events.recv() => {
                match event {
                    Some(BroadcastEvent::Ready { id, known }) => {
                        info!(id = %id, members = known.len(), "ready");
                    }
                    Some(BroadcastEvent::Deliver(delivery)) => {
                        let line = json!({
                            "msg": delivery.msg,
                            "local": delivery.local,
                            "error": delivery.error,
                        });
                        println!("{}", line);
                    }
                    Some(BroadcastEvent::MemberJoined(member)) => {
                        info!(id = %member.id, name = ?member.name, "member joined");
                    }
                    Some(BroadcastEvent::MemberLeft(id)) => {
                        info!(id = %id, "member left");
                    }
                    Some(BroadcastEvent::JoinFailed(reason)) => {
                        break Err(anyhow::anyhow!("failed to join group: {}", reason));
                    }
                    None => break Ok(()),
                }
            }
            _ = interval.tick() => {
                on_tick().await;
            }
        }
    };

    publisher.abort();
    result
}

async fn publish_stdin(group: CausalBroadcast) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let msg = Value::String(line);
        group.local_send(msg.clone()).await?;
        group.send(msg).await?;
    }
    Ok(())
}
