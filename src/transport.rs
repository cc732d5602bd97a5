//! # TCP Transport
//!
//! Implements [`Transport`] over plain TCP with delimiter-framed JSON
//! [`Envelope`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────┐
//! │ TcpTransport │───────────► │ TransportActor   │
//! └──────┬───────┘             │  links (LRU)     │
//!        │ connect             │  listeners       │
//!        ▼                     └────────▲─────────┘
//!  writer task ◄─ frames               │ Dispatch(envelope)
//!  reader task ────────────────────────┘
//! ```
//!
//! - One outbound link per destination; writes are serialized by a writer
//!   task, so frames to one peer leave in the order they were sent.
//! - Inbound sockets are only read. Replies travel over the replier's own
//!   outbound link, addressed by the envelope's declared `host`/`port`.
//! - The actor owns the link table and the listener registry. Reader tasks
//!   ask it which listeners match a decoded envelope and deliver to them
//!   themselves, so a slow subscriber stalls only the connections feeding
//!   it, and TCP flow control pushes back on the sender.
//!
//! ## Failure Handling
//!
//! - Malformed frames are logged and skipped; the connection stays open.
//! - Frames over [`MAX_FRAME_SIZE`](crate::messages::MAX_FRAME_SIZE) close
//!   the connection.
//! - A failed write closes the link; the next send reconnects.

use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::identity::PeerAddr;
use crate::messages::{decode, encode_frame, read_frame, Envelope};
use crate::protocols::{Inbound, LinkEvent, Subscription, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Maximum outbound links kept open; the least recently used is closed.
/// SECURITY: Bounds sockets and writer tasks held by one peer.
pub const MAX_LINKS: usize = 1024;

/// Time allowed for establishing an outbound link.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages buffered per subscription before readers wait for the consumer.
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Frames queued per outbound link.
const LINK_QUEUE_CAPACITY: usize = 64;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

const LINK_EVENT_CAPACITY: usize = 256;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

type OutgoingFrame = (Vec<u8>, oneshot::Sender<io::Result<()>>);

#[derive(Clone)]
struct Link {
    id: u64,
    tx: mpsc::Sender<OutgoingFrame>,
}

struct Listener {
    source: Option<PeerAddr>,
    tx: mpsc::Sender<Inbound>,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe {
        header: String,
        listener: Listener,
        reply: oneshot::Sender<()>,
    },
    GetLink(PeerAddr, oneshot::Sender<Option<Link>>),
    AddLink(PeerAddr, Link, oneshot::Sender<Link>),
    LinkClosed(PeerAddr, u64),
    Route {
        header: String,
        from: PeerAddr,
        reply: oneshot::Sender<Vec<mpsc::Sender<Inbound>>>,
    },
    Peers(oneshot::Sender<Vec<PeerAddr>>),
    Quit,
}

// ============================================================================
// TcpTransport Handle
// ============================================================================

pub struct TcpTransport {
    local: PeerAddr,
    cmd_tx: mpsc::Sender<Command>,
    link_tx: broadcast::Sender<LinkEvent>,
    listener: JoinHandle<()>,
}

impl TcpTransport {
    /// Listens on `addr` and starts the transport actor. Port 0 picks a free
    /// port, which is then advertised.
    pub async fn bind(addr: &PeerAddr) -> Result<Self> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port))
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        let port = listener.local_addr()?.port();
        let local = PeerAddr::new(addr.host.clone(), port);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (link_tx, _) = broadcast::channel(LINK_EVENT_CAPACITY);

        let actor = TransportActor::new(link_tx.clone());
        tokio::spawn(actor.run(cmd_rx));

        let accept = {
            let cmd_tx = cmd_tx.clone();
            let link_tx = link_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            debug!(remote = %remote, "new incoming connection");
                            tokio::spawn(read_inbound(stream, cmd_tx.clone(), link_tx.clone()));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            })
        };

        info!(addr = %local, "listening for incoming connections");

        Ok(Self {
            local,
            cmd_tx,
            link_tx,
            listener: accept,
        })
    }

    /// Destinations with an open outbound link.
    pub async fn peers(&self) -> Vec<PeerAddr> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops accepting connections and closes every outbound link.
    pub async fn shutdown(&self) {
        self.listener.abort();
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn link_to(&self, to: &PeerAddr) -> Result<Link> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetLink(to.clone(), tx))
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        if let Some(link) = rx
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?
        {
            return Ok(link);
        }

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((to.host.as_str(), to.port)),
        )
        .await
        .with_context(|| format!("connection to {} timed out", to))?
        .with_context(|| format!("failed to connect to {}", to))?;
        let _ = stream.set_nodelay(true);

        let link = spawn_link(stream, to.clone(), self.cmd_tx.clone());

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddLink(to.clone(), link, tx))
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport actor closed"))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> PeerAddr {
        self.local.clone()
    }

    async fn connect(&self, to: &PeerAddr) -> Result<()> {
        self.link_to(to).await.map(|_| ())
    }

    async fn send(&self, to: &PeerAddr, header: &str, data: Value) -> Result<()> {
        let envelope = Envelope {
            header: header.to_string(),
            data,
            host: self.local.host.clone(),
            port: self.local.port,
        };
        let frame = encode_frame(&envelope).context("failed to encode envelope")?;

        let link = self.link_to(to).await?;
        let (done_tx, done_rx) = oneshot::channel();
        link.tx
            .send((frame, done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("link to {} closed", to))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("link to {} closed", to))?
            .with_context(|| format!("failed to write to {}", to))?;

        trace!(peer = %to, header = header, "sent message");
        Ok(())
    }

    async fn subscribe(&self, header: &str, source: Option<PeerAddr>) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                header: header.to_string(),
                listener: Listener { source, tx },
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        Ok(Subscription::new(rx))
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

// ============================================================================
// Link Tasks
// ============================================================================

fn spawn_link(stream: TcpStream, peer: PeerAddr, cmd_tx: mpsc::Sender<Command>) -> Link {
    let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(LINK_QUEUE_CAPACITY);

    tokio::spawn(write_link(write, rx));
    tokio::spawn(async move {
        read_frames(read, &cmd_tx, None).await;
        let _ = cmd_tx.send(Command::LinkClosed(peer, id)).await;
    });

    Link { id, tx }
}

async fn write_link(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<OutgoingFrame>) {
    while let Some((frame, done)) = rx.recv().await {
        let result = write.write_all(&frame).await;
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Reads an accepted connection. The write half stays open for as long as
/// the peer keeps the connection, otherwise it would see the link closing.
async fn read_inbound(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<Command>,
    link_tx: broadcast::Sender<LinkEvent>,
) {
    let (read, _write) = stream.into_split();
    let mut sender = None;
    read_frames(read, &cmd_tx, Some(&mut sender)).await;
    if let Some(peer) = sender {
        debug!(peer = %peer, "incoming connection closed");
        let _ = link_tx.send(LinkEvent::Closed(peer));
    }
}

/// Decodes envelopes until the stream ends. When `sender` is given it is set
/// to the declared address of the first valid envelope.
async fn read_frames(
    read: OwnedReadHalf,
    cmd_tx: &mpsc::Sender<Command>,
    mut sender: Option<&mut Option<PeerAddr>>,
) {
    let mut reader = BufReader::new(read);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "closing connection");
                break;
            }
        };
        let envelope: Envelope = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to read incoming data, ignoring frame");
                continue;
            }
        };
        if let Some(slot) = sender.as_deref_mut()
            && slot.is_none()
        {
            *slot = Some(envelope.sender());
        }
        if !deliver(envelope, cmd_tx).await {
            break;
        }
    }
}

/// Hands `envelope` to every matching listener, waiting for room in each.
/// Returns false once the actor is gone.
async fn deliver(envelope: Envelope, cmd_tx: &mpsc::Sender<Command>) -> bool {
    let from = envelope.sender();
    trace!(peer = %from, header = %envelope.header, "received message");

    let (reply_tx, reply_rx) = oneshot::channel();
    let route = Command::Route {
        header: envelope.header.clone(),
        from: from.clone(),
        reply: reply_tx,
    };
    if cmd_tx.send(route).await.is_err() {
        return false;
    }
    let Ok(targets) = reply_rx.await else {
        return false;
    };
    if targets.is_empty() {
        trace!(header = %envelope.header, "no listener for header");
    }

    for tx in targets {
        let inbound = Inbound {
            data: envelope.data.clone(),
            from: from.clone(),
        };
        // A dropped subscription fails immediately and is pruned on the next route.
        let _ = tx.send(inbound).await;
    }
    true
}

// ============================================================================
// Transport Actor
// ============================================================================

struct TransportActor {
    links: LruCache<PeerAddr, Link>,
    listeners: HashMap<String, Vec<Listener>>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl TransportActor {
    fn new(link_tx: broadcast::Sender<LinkEvent>) -> Self {
        Self {
            links: LruCache::new(NonZeroUsize::new(MAX_LINKS).expect("MAX_LINKS must be non-zero")),
            listeners: HashMap::new(),
            link_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Subscribe {
                    header,
                    listener,
                    reply,
                } => {
                    self.listeners.entry(header).or_default().push(listener);
                    let _ = reply.send(());
                }
                Command::GetLink(peer, reply) => {
                    let _ = reply.send(self.links.get(&peer).cloned());
                }
                Command::AddLink(peer, link, reply) => {
                    let _ = reply.send(self.add_link(peer, link));
                }
                Command::LinkClosed(peer, id) => {
                    if self.links.peek(&peer).is_some_and(|l| l.id == id) {
                        self.links.pop(&peer);
                        debug!(peer = %peer, "connection closed");
                        let _ = self.link_tx.send(LinkEvent::Closed(peer));
                    }
                }
                Command::Route {
                    header,
                    from,
                    reply,
                } => {
                    let _ = reply.send(self.route(&header, &from));
                }
                Command::Peers(reply) => {
                    let _ = reply.send(self.links.iter().map(|(p, _)| p.clone()).collect());
                }
                Command::Quit => {
                    debug!("transport actor quitting");
                    break;
                }
            }
        }
    }

    /// Keeps an existing live link when two connects race.
    fn add_link(&mut self, peer: PeerAddr, link: Link) -> Link {
        if let Some(existing) = self.links.get(&peer)
            && !existing.tx.is_closed()
        {
            return existing.clone();
        }
        if let Some((evicted, _)) = self.links.push(peer.clone(), link.clone())
            && evicted != peer
        {
            debug!(peer = %evicted, "link evicted from cache");
        }
        debug!(peer = %peer, "connected");
        let _ = self.link_tx.send(LinkEvent::Opened(peer));
        link
    }

    /// Live listeners for `header` that accept messages from `from`.
    fn route(&mut self, header: &str, from: &PeerAddr) -> Vec<mpsc::Sender<Inbound>> {
        let Some(listeners) = self.listeners.get_mut(header) else {
            return Vec::new();
        };
        listeners.retain(|l| !l.tx.is_closed());

        let targets = listeners
            .iter()
            .filter(|l| l.source.as_ref().is_none_or(|s| s == from))
            .map(|l| l.tx.clone())
            .collect();

        if listeners.is_empty() {
            self.listeners.remove(header);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU16;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

    fn local() -> PeerAddr {
        PeerAddr::new("127.0.0.1", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    async fn recv(sub: &mut Subscription) -> Inbound {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn unfiltered_and_filtered_listeners() {
        let a = TcpTransport::bind(&local()).await.unwrap();
        let b = TcpTransport::bind(&local()).await.unwrap();
        let c = TcpTransport::bind(&local()).await.unwrap();

        let mut any = b.subscribe("HELLO", None).await.unwrap();
        let mut only_c = b.subscribe("HELLO", Some(c.local_addr())).await.unwrap();

        a.send(&b.local_addr(), "HELLO", json!("from a")).await.unwrap();
        c.send(&b.local_addr(), "HELLO", json!("from c")).await.unwrap();

        let first = recv(&mut any).await;
        let second = recv(&mut any).await;
        let mut seen = vec![first.data, second.data];
        seen.sort_by_key(|v| v.to_string());
        assert_eq!(seen, vec![json!("from a"), json!("from c")]);

        let filtered = recv(&mut only_c).await;
        assert_eq!(filtered.data, json!("from c"));
        assert_eq!(filtered.from, c.local_addr());
    }

    #[tokio::test]
    async fn duplicate_subscription_fires_twice() {
        let a = TcpTransport::bind(&local()).await.unwrap();
        let b = TcpTransport::bind(&local()).await.unwrap();

        let mut first = b.subscribe("PING", None).await.unwrap();
        let mut second = b.subscribe("PING", None).await.unwrap();

        a.send(&b.local_addr(), "PING", json!(1)).await.unwrap();
        assert_eq!(recv(&mut first).await.data, json!(1));
        assert_eq!(recv(&mut second).await.data, json!(1));
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let b = TcpTransport::bind(&local()).await.unwrap();
        let mut sub = b.subscribe("OK", None).await.unwrap();

        let mut raw = TcpStream::connect(("127.0.0.1", b.local_addr().port))
            .await
            .unwrap();
        raw.write_all(b"not json\x04").await.unwrap();
        let good = encode_frame(&Envelope {
            header: "OK".into(),
            data: json!(true),
            host: "127.0.0.1".into(),
            port: 1,
        })
        .unwrap();
        raw.write_all(&good).await.unwrap();

        let inbound = recv(&mut sub).await;
        assert_eq!(inbound.data, json!(true));
        assert_eq!(inbound.from, PeerAddr::new("127.0.0.1", 1));
    }

    #[tokio::test]
    async fn slow_subscriber_loses_nothing() {
        let a = Arc::new(TcpTransport::bind(&local()).await.unwrap());
        let b = TcpTransport::bind(&local()).await.unwrap();
        let mut sub = b.subscribe("SEQ", None).await.unwrap();

        let total = SUBSCRIPTION_CAPACITY * 4;
        let to = b.local_addr();
        let sender = {
            let a = a.clone();
            tokio::spawn(async move {
                for i in 0..total {
                    a.send(&to, "SEQ", json!(i)).await.unwrap();
                }
            })
        };

        // Leave the subscription unread well past its capacity.
        tokio::time::sleep(Duration::from_millis(300)).await;

        for i in 0..total {
            assert_eq!(recv(&mut sub).await.data, json!(i));
        }
        tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .expect("sender stalled")
            .unwrap();
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_fails() {
        let a = TcpTransport::bind(&local()).await.unwrap();
        let nobody = local();
        assert!(a.send(&nobody, "X", json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn links_are_reused() {
        let a = TcpTransport::bind(&local()).await.unwrap();
        let b = TcpTransport::bind(&local()).await.unwrap();
        let mut events = a.link_events();

        a.connect(&b.local_addr()).await.unwrap();
        a.connect(&b.local_addr()).await.unwrap();
        a.send(&b.local_addr(), "X", json!(1)).await.unwrap();

        assert_eq!(a.peers().await, vec![b.local_addr()]);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Opened(b.local_addr()));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_link_is_reported() {
        let a = TcpTransport::bind(&local()).await.unwrap();
        let b = TcpTransport::bind(&local()).await.unwrap();
        let mut events = b.link_events();

        a.send(&b.local_addr(), "X", json!(1)).await.unwrap();
        a.shutdown().await;
        drop(a);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert!(matches!(event, LinkEvent::Closed(_)));
    }
}
