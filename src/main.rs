use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::seq::SliceRandom;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshsub::{GossipSubConfig, GossipSubRouter, Keypair, MemoryNetwork, PubSub, PubSubConfig, PubSubHooks};

/// Extra random links per node on top of the ring.
const EXTRA_LINKS: usize = 3;

#[derive(Parser, Debug)]
#[command(name = "meshsub")]
#[command(author, version, about = "Run an in-memory GossipSub swarm", long_about = None)]
struct Args {
    /// Number of nodes in the swarm.
    #[arg(short, long, default_value = "20")]
    nodes: usize,

    /// Target mesh degree D.
    #[arg(short, long, default_value = "6")]
    degree: usize,

    #[arg(short, long, default_value = "demo")]
    topic: String,

    /// Messages to publish, round-robin over the nodes.
    #[arg(short, long, default_value = "50")]
    messages: usize,

    #[arg(short, long, default_value = "200")]
    interval_ms: u64,

    /// Seconds between telemetry snapshots.
    #[arg(long, default_value = "2")]
    telemetry_interval: u64,
}

async fn build_swarm(args: &Args) -> Result<(Arc<MemoryNetwork>, Vec<PubSub>)> {
    if args.nodes < 2 {
        bail!("need at least two nodes");
    }
    if args.degree == 0 {
        bail!("degree must be positive");
    }

    let network = MemoryNetwork::new();
    let d_lo = args.degree.saturating_sub(1).max(1);
    let d_hi = args.degree * 2;
    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let router = GossipSubRouter::new(GossipSubConfig::default().with_degree(args.degree, d_lo, d_hi))
            .context("invalid router configuration")?;
        let node = network.spawn_node(Keypair::generate(), router, PubSubConfig::default(), PubSubHooks::default())?;
        nodes.push(node);
    }

    let ids: Vec<_> = nodes.iter().map(PubSub::local_peer_id).collect();
    let mut rng = rand::thread_rng();
    for (i, id) in ids.iter().enumerate() {
        let next = ids[(i + 1) % ids.len()];
        if next != *id {
            network.connect(id, &next).await?;
        }
        let extra: Vec<_> = ids.choose_multiple(&mut rng, EXTRA_LINKS).copied().collect();
        for other in extra {
            if other != *id && !network.is_linked(id, &other) {
                network.connect(id, &other).await?;
            }
        }
    }
    Ok((network, nodes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let (_network, nodes) = build_swarm(&args).await?;
    info!(nodes = nodes.len(), degree = args.degree, topic = %args.topic, "swarm ready");

    let delivered = Arc::new(AtomicU64::new(0));
    let mut topics = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let topic = node.join(&args.topic).await?;
        let mut sub = topic.subscribe().await?;
        let delivered = Arc::clone(&delivered);
        tokio::spawn(async move {
            while sub.next().await.is_ok() {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        });
        topics.push(topic);
    }

    let mut publish = time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let mut published = 0usize;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = publish.tick(), if published < args.messages => {
                let topic = &topics[published % topics.len()];
                let payload = format!("message {}", published);
                match topic.publish(payload.into_bytes()).await {
                    Ok(id) => info!(seq = published, id = ?id, "published"),
                    Err(e) => warn!(error = %e, "publish failed"),
                }
                published += 1;
            }
            _ = telemetry.tick() => {
                let mut sizes = Vec::with_capacity(nodes.len());
                for node in &nodes {
                    sizes.push(node.mesh_peers(&args.topic).await?.len());
                }
                let min = sizes.iter().min().copied().unwrap_or_default();
                let max = sizes.iter().max().copied().unwrap_or_default();
                let expected = (published * nodes.len()) as u64;
                let delivered = delivered.load(Ordering::Relaxed);
                info!(
                    published,
                    delivered,
                    expected,
                    mesh_min = min,
                    mesh_max = max,
                    "telemetry snapshot"
                );
                if published >= args.messages && delivered >= expected {
                    info!("all messages delivered");
                    break;
                }
            }
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
