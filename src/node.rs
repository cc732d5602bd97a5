//! # High-Level Node API
//!
//! A [`Node`] is one peer: a TCP transport, the peer sampling service running
//! on it, and at most one full-mesh broadcast group.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(&PeerAddr::new("127.0.0.1", 7000)).await?;
//!
//! // Enter the gossip overlay through a known peer
//! node.bootstrap(&"127.0.0.1:7001".parse()?).await?;
//!
//! // Join the broadcast group that peer belongs to
//! let (group, mut events) = node.join_group(&"127.0.0.1:7001".parse()?).await?;
//! group.local_send(json!("hello")).await?;
//! group.send(json!("hello")).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::identity::PeerAddr;
use crate::mesh::{MeshGroup, MeshMode};
use crate::pbcast::{BroadcastConfig, BroadcastEvent, CausalBroadcast};
use crate::peer_sampling::{PeerSampling, PeerSamplingConfig};
use crate::transport::TcpTransport;
use crate::view::View;

#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub sampling: PeerSamplingConfig,
    pub broadcast: BroadcastConfig,
}

pub struct Node {
    transport: Arc<TcpTransport>,
    sampling: PeerSampling,
    config: NodeConfig,
    group: tokio::sync::Mutex<Option<CausalBroadcast>>,
}

impl Node {
    /// Listens on `addr` with default settings.
    pub async fn bind(addr: &PeerAddr) -> Result<Self> {
        Self::bind_with_config(addr, NodeConfig::default()).await
    }

    pub async fn bind_with_config(addr: &PeerAddr, config: NodeConfig) -> Result<Self> {
        let transport = Arc::new(
            TcpTransport::bind(addr)
                .await
                .context("failed to start transport")?,
        );
        let sampling = PeerSampling::spawn(transport.clone(), config.sampling.clone())
            .await
            .context("failed to start peer sampling")?;

        info!(addr = %sampling.local_addr(), "node started");
        Ok(Self {
            transport,
            sampling,
            config,
            group: tokio::sync::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.sampling.local_addr().clone()
    }

    /// Exchanges views with `contact`; afterwards gossip keeps the view
    /// fresh on its own.
    pub async fn bootstrap(&self, contact: &PeerAddr) -> Result<()> {
        self.sampling
            .join(contact.clone())
            .await
            .with_context(|| format!("failed to bootstrap through {}", contact))
    }

    /// Current partial view of the overlay.
    pub async fn view(&self) -> View {
        self.sampling.view().await
    }

    /// Peers with an open outbound link.
    pub async fn peers(&self) -> Vec<PeerAddr> {
        self.transport.peers().await
    }

    /// Creates a new group sized for about `r` members with `k` clock slots
    /// each. Fails on invalid parameters or if this node is already in one.
    pub async fn found_group(
        &self,
        r: u64,
        k: usize,
    ) -> Result<(CausalBroadcast, mpsc::Receiver<BroadcastEvent>)> {
        self.start_group(MeshMode::Found { r, k }).await
    }

    /// Joins the group `contact` belongs to. The join completes in the
    /// background; watch for `Ready` or `JoinFailed`.
    pub async fn join_group(
        &self,
        contact: &PeerAddr,
    ) -> Result<(CausalBroadcast, mpsc::Receiver<BroadcastEvent>)> {
        self.start_group(MeshMode::Join(contact.clone())).await
    }

    async fn start_group(
        &self,
        mode: MeshMode,
    ) -> Result<(CausalBroadcast, mpsc::Receiver<BroadcastEvent>)> {
        let mut slot = self.group.lock().await;
        if slot.is_some() {
            anyhow::bail!("node already belongs to a group");
        }
        let mesh = MeshGroup::spawn(self.transport.clone(), mode).await?;
        let (group, events) =
            CausalBroadcast::spawn(Arc::new(mesh), self.config.broadcast.clone()).await?;
        *slot = Some(group.clone());
        Ok((group, events))
    }

    /// Leaves the group, stops gossiping and closes every link.
    pub async fn shutdown(&self) {
        if let Some(group) = self.group.lock().await.take() {
            let _ = group.quit().await;
        }
        self.sampling.quit().await;
        self.transport.shutdown().await;
        info!(addr = %self.local_addr(), "node stopped");
    }
}
