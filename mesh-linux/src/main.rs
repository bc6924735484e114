// Mesh node daemon: one node, simulated links over UDP, relations on disk.

mod config;
mod link;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mesh_core::{
    HostIdentity, Inbound, InboundHandler, Network, NetworkObserver, Peer, StateChange,
    SystemClock,
};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Score windows slide once per this many heartbeat intervals.
const SCORE_REFRESH_INTERVALS: u32 = 5;

fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> Result<()> {
    let mac = cfg.mac()?;
    let host = HostIdentity::new(&cfg.name, mac).with_bus_addresses(cfg.i2c_address, cfg.can_address);
    let mut net = Network::new(cfg.network.clone(), host, Arc::new(SystemClock::new()));
    for l in &cfg.links {
        let kind = l.kind()?;
        let link = link::UdpLink::bind(kind, mac, l.bind, l.remotes.clone(), l.max_frame).await?;
        net.add_transport(link);
    }
    if net.host_transports().is_empty() {
        tracing::warn!("no links configured, node cannot reach anyone");
    }
    net.set_relation_store(Arc::new(store::FileRelationStore::new(&cfg.relations)));
    net.add_observer(Arc::new(LogObserver));
    net.set_inbound_handler(Arc::new(LogInbound));
    let net = Arc::new(net);

    let recovered = net
        .recover_relations()
        .with_context(|| format!("reading relations from {}", cfg.relations.display()))?;
    for p in &cfg.peers {
        let supported = p.transports()?;
        match net.add_peer(&p.name, p.mac()?, supported) {
            Ok(_) => {}
            Err(err) => tracing::info!(peer = %p.name, %err, "static peer not added"),
        }
    }
    net.start()?;
    tracing::info!(name = %cfg.name, %mac, recovered, peers = cfg.peers.len(), "node up");

    let interval = Duration::from_millis(cfg.network.heartbeat_interval_ms.max(1));
    let heartbeat_check = Duration::from_millis(cfg.network.problem_heartbeat_ms.max(1));
    let tasks = [
        recurring(net.clone(), "health", interval, |n| n.tick_health()),
        recurring(net.clone(), "heartbeat", heartbeat_check, |n| {
            n.send_heartbeats();
        }),
        recurring(net.clone(), "scores", interval * SCORE_REFRESH_INTERVALS, |n| {
            n.refresh_scores()
        }),
    ];

    shutdown_signal().await?;
    tracing::info!("shutting down");
    for t in &tasks {
        t.abort();
    }
    let n = net.clone();
    tokio::task::spawn_blocking(move || n.shutdown()).await?;
    Ok(())
}

/// Run `f` every `every` on the blocking pool; core calls may wait on peers.
fn recurring(
    net: Arc<Network>,
    what: &'static str,
    every: Duration,
    f: fn(&Network),
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let n = net.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || f(&n)).await {
                tracing::error!(task = what, %err, "recurring task failed");
            }
        }
    })
}

struct LogObserver;

impl NetworkObserver for LogObserver {
    fn on_state_change(&self, change: &StateChange) {
        tracing::debug!(
            peer = %change.peer_name,
            transport = %change.transport,
            from = %change.from,
            to = %change.to,
            "transport state"
        );
    }

    fn on_new_peer(&self, peer: &Peer) -> bool {
        tracing::info!(peer = %peer.name, mac = %peer.mac, transports = ?peer.supported, "new peer");
        true
    }
}

struct LogInbound;

impl InboundHandler for LogInbound {
    fn on_message(&self, inbound: &Inbound) {
        tracing::info!(
            peer = %inbound.peer_name,
            transport = %inbound.transport,
            len = inbound.message.binary.len(),
            strings = inbound.message.strings.len(),
            "message"
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
