//! Protocol trait definitions for floodit's networking layer.
//!
//! Gossip membership and causal broadcast are written against two traits
//! rather than against concrete sockets:
//!
//! | Trait | Implementations | Purpose |
//! |-------|-----------------|---------|
//! | [`Transport`] | `TcpTransport` | Addressed, header-keyed messaging between peers |
//! | [`GroupTransport`] | `MeshGroup`, `RelayGroup` | Group session, fan-out and membership events |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Let peer sampling and the mesh group depend only on [`Transport`]
//! - Keep causal delivery in one place regardless of the group topology
//! - Avoid circular dependencies between modules

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::identity::PeerAddr;
use crate::messages::CausalMessage;

// ============================================================================
// Transport
// ============================================================================

/// A message received through a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    pub data: Value,
    /// Declared listening address of the sender.
    pub from: PeerAddr,
}

/// Receiving end of a header subscription. Dropping it unregisters the
/// subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Inbound>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Inbound>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// Connection state changes observed by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Opened(PeerAddr),
    Closed(PeerAddr),
}

/// Addressed messaging between peers.
///
/// Every subscription matching an incoming message receives it: those
/// registered without a source see all senders, those registered with one
/// only that sender, and two identical subscriptions both fire.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address advertised to other peers.
    fn local_addr(&self) -> PeerAddr;

    /// Opens a link to `to` unless one already exists.
    async fn connect(&self, to: &PeerAddr) -> Result<()>;

    /// Resolves once the message is written to the link.
    async fn send(&self, to: &PeerAddr, header: &str, data: Value) -> Result<()>;

    async fn subscribe(&self, header: &str, source: Option<PeerAddr>) -> Result<Subscription>;

    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}

// ============================================================================
// Group Transport
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub name: Option<String>,
}

impl Member {
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// What a peer learns when its group session is established.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupSession {
    pub id: String,
    /// Slots owned by this peer.
    pub entries: Vec<usize>,
    /// Clock width shared by the group.
    pub width: usize,
    pub members: Vec<Member>,
    pub name: Option<String>,
    pub document_title: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GroupEvent {
    Message(CausalMessage),
    MemberJoined(Member),
    MemberLeft(String),
}

/// A group topology carrying stamped messages between members.
///
/// Events are produced from construction onwards, so messages that arrive
/// while [`GroupTransport::join`] is still running are not lost.
#[async_trait]
pub trait GroupTransport: Send + Sync + 'static {
    /// Establishes the session. Fails on an unreachable contact or invalid
    /// group parameters.
    async fn join(&self) -> Result<GroupSession>;

    /// Sends to every current member except this peer.
    async fn broadcast(&self, message: CausalMessage) -> Result<()>;

    async fn leave(&self) -> Result<()>;

    /// Event stream; can be taken once.
    async fn events(&self) -> Result<mpsc::Receiver<GroupEvent>>;
}
