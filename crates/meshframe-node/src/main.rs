//! Meshframe demo binary.
//!
//! Starts a handful of nodes on an in-process network, lets them find each
//! other through the first node, then exchanges encrypted messages and one
//! attachment.
//!
//! # Usage
//!
//! ```bash
//! meshframe-node --peers 4 --messages 2
//! RUST_LOG=meshframe_node=debug meshframe-node
//! ```

use std::{sync::Arc, time::Duration};

use clap::Parser;
use meshframe_core::LocalPeer;
use meshframe_node::{MemoryDirectory, MemoryNetwork, Node, NodeConfig, Notification};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Meshframe in-process mesh demo
#[derive(Parser, Debug)]
#[command(name = "meshframe-node")]
#[command(about = "Run an encrypted mesh of in-process nodes")]
#[command(version)]
struct Args {
    /// Number of nodes
    #[arg(short, long, default_value = "3")]
    peers: usize,

    /// Chat messages each node sends
    #[arg(short, long, default_value = "3")]
    messages: usize,

    /// Seconds to wait for the mesh to converge
    #[arg(long, default_value = "10")]
    converge_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if args.peers < 2 {
        return Err("a mesh needs at least two peers".into());
    }

    let network = MemoryNetwork::new();
    let directory = Arc::new(MemoryDirectory::new());
    let anchor = peer_id(0);

    let mut nodes = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        let local = LocalPeer {
            peer_id: peer_id(index),
            name: format!("Node {index}"),
            device_id: format!("device-{index}"),
            user_id: format!("user-{index}"),
        };
        let mut config = NodeConfig::new(local, "demo");
        if index > 0 {
            config = config.with_anchor(anchor.clone());
        }

        let endpoint = network.endpoint(&peer_id(index));
        let mut node = Node::spawn(config, endpoint, directory.clone()).await;
        if let Some(mut notifications) = node.take_notifications() {
            let name = node.peer_id().to_string();
            tokio::spawn(async move {
                while let Some(notification) = notifications.recv().await {
                    log_notification(&name, &notification);
                }
            });
        }
        nodes.push(node);
    }

    let converged = tokio::time::timeout(
        Duration::from_secs(args.converge_timeout),
        wait_for_mesh(&nodes),
    )
    .await;
    if converged.is_err() {
        tracing::warn!("mesh did not fully converge; sending anyway");
    } else {
        tracing::info!("{} nodes fully meshed", nodes.len());
    }

    for node in &nodes {
        for n in 0..args.messages {
            let text = format!("hello #{n} from {}", node.peer_id());
            let (_, outcomes) = node.send_text(&text).await;
            for (peer, outcome) in outcomes {
                tracing::debug!("{} -> {}: {:?}", node.peer_id(), peer, outcome);
            }
        }
    }

    if let Some(first) = nodes.first() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        first.send_file("demo.bin", "application/octet-stream", &data).await?;
    }

    // Let in-flight frames land before tearing down
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in nodes {
        network.disconnect(node.peer_id());
        node.shutdown().await;
    }

    Ok(())
}

fn peer_id(index: usize) -> String {
    format!("peer-{index:02}")
}

async fn wait_for_mesh(nodes: &[Node]) {
    let others = nodes.len() - 1;
    loop {
        let meshed = nodes.iter().all(|node| {
            let peers = node.connected_peers();
            peers.len() == others && peers.iter().all(|peer| node.session_ready(peer))
        });
        if meshed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn log_notification(node: &str, notification: &Notification) {
    match notification {
        Notification::Status { peer_id, status } => {
            tracing::info!("[{}] {} is {:?}", node, peer_id, status);
        },
        Notification::Member(member) => {
            tracing::debug!("[{}] member {} ({})", node, member.name, member.connection_id);
        },
        Notification::SessionReady { peer_id } => {
            tracing::info!("[{}] session with {} ready", node, peer_id);
        },
        Notification::Message { from, message } => {
            if message.attachments.is_empty() {
                tracing::info!("[{}] {}: {}", node, from, message.text);
            } else {
                tracing::info!("[{}] {} sent {} file(s)", node, from, message.attachments.len());
            }
        },
        Notification::Edited { from, message } => {
            tracing::info!("[{}] {} edited: {}", node, from, message.text);
        },
        Notification::Deleted { from, id } => tracing::info!("[{}] {} deleted {}", node, from, id),
        Notification::Read { from, id } => tracing::info!("[{}] {} read {}", node, from, id),
        Notification::Attachment { from, attachment } => {
            tracing::info!(
                "[{}] {} from {}: {} bytes",
                node,
                attachment.name,
                from,
                attachment.data.len()
            );
        },
        Notification::Failed { peer_id, error } => {
            tracing::error!("[{}] gave up on {}: {}", node, peer_id, error);
        },
    }
}
