//! # Relay Hub
//!
//! Centralized alternative to the full mesh: clients connect to one hub over
//! TCP and the hub forwards their messages to everyone editing the same
//! document.
//!
//! ## Server Side
//! - [`RelayHub`]: the public handle; accepts connections
//! - `HubActor`: owns documents and client queues, processes events
//!   sequentially
//!
//! ## Client Side
//! - [`RelayGroup`]: a [`GroupTransport`] backed by one hub connection
//!
//! ## Documents
//!
//! | Event | Hub action |
//! |-------|------------|
//! | `JOIN_REQ` | create the document on first use, assign an id and slots, reply `JOIN_RESP`, replay history, announce `USER_CONNECTED` |
//! | `MSG` | forward to every other user of the document, append to history |
//! | disconnect | announce `USER_DISCONNECTED`; delete the document once empty |
//!
//! Frames are bare [`RelayMessage`]s separated by the usual delimiter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::entries_hash::{EntriesHash, EntriesHashGenerator};
use crate::identity::{IdSource, MonotonicIds, PeerAddr};
use crate::messages::{
    decode, encode_frame, read_frame, CausalMessage, KnownUser, RelayJoinRequest,
    RelayJoinResponse, RelayMessage, UserLeft,
};
use crate::protocols::{GroupEvent, GroupSession, GroupTransport, Member};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<T>>>;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_HUB_PORT: u16 = 5000;

/// Expected number of users per document.
pub const DEFAULT_HUB_R: u64 = 100;

/// Clock slots per user.
pub const DEFAULT_HUB_K: usize = 5;

/// Messages kept per document for replay to late joiners.
/// SECURITY: Oldest messages are dropped beyond this bound.
pub const DEFAULT_MAX_HISTORY: usize = 100_000;

/// SECURITY: Join requests for new documents are refused beyond this bound.
pub const DEFAULT_MAX_DOCUMENTS: usize = 10_000;

/// Frames queued per client. Large enough for a full history replay.
const CLIENT_QUEUE_CAPACITY: usize = DEFAULT_MAX_HISTORY + 1024;

/// Time allowed for the hub to answer a join request.
pub const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub r: u64,
    pub k: usize,
    pub max_history: usize,
    pub max_documents: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            r: DEFAULT_HUB_R,
            k: DEFAULT_HUB_K,
            max_history: DEFAULT_MAX_HISTORY,
            max_documents: DEFAULT_MAX_DOCUMENTS,
        }
    }
}

/// Snapshot of one open document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentStats {
    pub title: String,
    pub users: usize,
    pub history: usize,
}

// ============================================================================
// Commands sent to the Hub Actor
// ============================================================================

enum HubCommand {
    Connected(u64, mpsc::Sender<Vec<u8>>),
    Frame(u64, RelayMessage),
    Disconnected(u64),
    Documents(oneshot::Sender<Vec<DocumentStats>>),
    Quit,
}

// ============================================================================
// RelayHub Handle
// ============================================================================

pub struct RelayHub {
    local: PeerAddr,
    cmd_tx: mpsc::Sender<HubCommand>,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub").field("local", &self.local).finish()
    }
}

impl RelayHub {
    /// Listens on `addr` with time-ordered user ids.
    pub async fn bind(addr: &PeerAddr, config: HubConfig) -> Result<Self> {
        Self::bind_with_ids(addr, config, Box::new(MonotonicIds::new())).await
    }

    /// Listens on `addr`; user ids are drawn from `ids`. Fails if `config`
    /// cannot produce an [`EntriesHash`].
    pub async fn bind_with_ids(
        addr: &PeerAddr,
        config: HubConfig,
        ids: Box<dyn IdSource>,
    ) -> Result<Self> {
        let generator = EntriesHashGenerator::default();
        generator
            .generate(config.r, config.k)
            .context("invalid hub parameters")?;

        let listener = TcpListener::bind((addr.host.as_str(), addr.port))
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
        let local = PeerAddr::new(addr.host.clone(), listener.local_addr()?.port());

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let actor = HubActor {
            config,
            generator,
            ids,
            clients: HashMap::new(),
            documents: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        let accept = {
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            debug!(remote = %remote, "relay client connected");
                            tokio::spawn(serve_client(stream, cmd_tx.clone()));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            })
        };

        info!(addr = %local, "relay hub listening");
        Ok(Self {
            local,
            cmd_tx,
            listener: accept,
        })
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.local.clone()
    }

    pub async fn documents(&self) -> Vec<DocumentStats> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(HubCommand::Documents(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops accepting clients and drops every open connection.
    pub async fn shutdown(&self) {
        self.listener.abort();
        let _ = self.cmd_tx.send(HubCommand::Quit).await;
    }
}

impl Drop for RelayHub {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn serve_client(stream: TcpStream, cmd_tx: mpsc::Sender<HubCommand>) {
    let _ = stream.set_nodelay(true);
    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    tokio::spawn(write_frames(write, rx));

    if cmd_tx.send(HubCommand::Connected(conn, tx)).await.is_err() {
        return;
    }
    let frames_tx = cmd_tx.clone();
    read_relay_frames(read, move |msg| {
        let tx = frames_tx.clone();
        async move { tx.send(HubCommand::Frame(conn, msg)).await.is_ok() }
    })
    .await;
    let _ = cmd_tx.send(HubCommand::Disconnected(conn)).await;
}

async fn write_frames(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            debug!(error = %e, "relay write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Decodes relay frames until the stream ends or `forward` returns false.
async fn read_relay_frames<F, Fut>(read: OwnedReadHalf, mut forward: F)
where
    F: FnMut(RelayMessage) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut reader = BufReader::new(read);
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "closing relay connection");
                break;
            }
        };
        match decode::<RelayMessage>(&frame) {
            Ok(msg) => {
                if !forward(msg).await {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "malformed relay frame, ignoring"),
        }
    }
}

// ============================================================================
// Hub Actor
// ============================================================================

struct Client {
    tx: mpsc::Sender<Vec<u8>>,
    /// Document title and user id, once joined.
    session: Option<(String, String)>,
}

struct DocumentUser {
    id: String,
    name: String,
    conn: u64,
}

struct Document {
    hash: EntriesHash,
    users: Vec<DocumentUser>,
    history: VecDeque<Value>,
}

struct HubActor {
    config: HubConfig,
    generator: EntriesHashGenerator,
    ids: Box<dyn IdSource>,
    clients: HashMap<u64, Client>,
    documents: HashMap<String, Document>,
}

impl HubActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HubCommand::Connected(conn, tx) => {
                    self.clients.insert(conn, Client { tx, session: None });
                }
                HubCommand::Frame(conn, msg) => self.handle_frame(conn, msg),
                HubCommand::Disconnected(conn) => self.handle_disconnect(conn),
                HubCommand::Documents(reply) => {
                    let stats = self
                        .documents
                        .iter()
                        .map(|(title, doc)| DocumentStats {
                            title: title.clone(),
                            users: doc.users.len(),
                            history: doc.history.len(),
                        })
                        .collect();
                    let _ = reply.send(stats);
                }
                HubCommand::Quit => {
                    debug!("relay hub actor quitting");
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, conn: u64, msg: RelayMessage) {
        match msg {
            RelayMessage::JoinReq(request) => self.handle_join(conn, request),
            RelayMessage::Msg(data) => self.handle_msg(conn, data),
            other => {
                debug!(conn = conn, message = ?other, "unexpected frame from client");
            }
        }
    }

    fn handle_join(&mut self, conn: u64, request: RelayJoinRequest) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        if client.session.is_some() {
            warn!(conn = conn, "client joined twice, ignoring");
            return;
        }

        let title = request.document_title;
        if !self.documents.contains_key(&title) {
            if self.documents.len() >= self.config.max_documents {
                warn!(document = %title, max = self.config.max_documents, "document limit reached");
                return;
            }
            let hash = match self.generator.generate(self.config.r, self.config.k) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(error = %e, "failed to set up document");
                    return;
                }
            };
            info!(document = %title, "document opened");
            self.documents.insert(
                title.clone(),
                Document {
                    hash,
                    users: Vec::new(),
                    history: VecDeque::new(),
                },
            );
        }
        let Some(doc) = self.documents.get_mut(&title) else {
            return;
        };

        let id = self.ids.next_id();
        let response = RelayMessage::JoinResp(RelayJoinResponse {
            id: id.clone(),
            name: request.user_name.clone(),
            known_users: doc
                .users
                .iter()
                .map(|u| KnownUser {
                    id: u.id.clone(),
                    name: u.name.clone(),
                })
                .collect(),
            r: doc.hash.m(),
            entries: doc.hash.hash(&id),
            document_title: title.clone(),
        });
        send_to(&self.clients, conn, &response);
        for data in &doc.history {
            send_to(&self.clients, conn, &RelayMessage::Msg(data.clone()));
        }

        let connected = RelayMessage::UserConnected(KnownUser {
            id: id.clone(),
            name: request.user_name.clone(),
        });
        send_to_many(&self.clients, doc.users.iter().map(|u| u.conn), &connected);

        doc.users.push(DocumentUser {
            id: id.clone(),
            name: request.user_name,
            conn,
        });
        debug!(document = %title, user = %id, users = doc.users.len(), "user joined document");

        if let Some(client) = self.clients.get_mut(&conn) {
            client.session = Some((title, id));
        }
    }

    fn handle_msg(&mut self, conn: u64, data: Value) {
        let Some((title, _)) = self.clients.get(&conn).and_then(|c| c.session.as_ref()) else {
            debug!(conn = conn, "message before join, ignoring");
            return;
        };
        let Some(doc) = self.documents.get_mut(title) else {
            return;
        };

        let msg = RelayMessage::Msg(data);
        let others = doc.users.iter().filter(|u| u.conn != conn).map(|u| u.conn);
        send_to_many(&self.clients, others, &msg);

        if let RelayMessage::Msg(data) = msg {
            if doc.history.len() >= self.config.max_history {
                doc.history.pop_front();
            }
            doc.history.push_back(data);
        }
        trace!(document = %title, history = doc.history.len(), "relayed message");
    }

    fn handle_disconnect(&mut self, conn: u64) {
        let Some(client) = self.clients.remove(&conn) else {
            return;
        };
        let Some((title, id)) = client.session else {
            return;
        };
        let Some(doc) = self.documents.get_mut(&title) else {
            return;
        };

        doc.users.retain(|u| u.conn != conn);
        let left = RelayMessage::UserDisconnected(UserLeft { id: id.clone() });
        send_to_many(&self.clients, doc.users.iter().map(|u| u.conn), &left);
        debug!(document = %title, user = %id, "user left document");

        if doc.users.is_empty() {
            self.documents.remove(&title);
            info!(document = %title, "document closed");
        }
    }
}

fn send_to(clients: &HashMap<u64, Client>, conn: u64, msg: &RelayMessage) {
    send_to_many(clients, std::iter::once(conn), msg);
}

fn send_to_many(
    clients: &HashMap<u64, Client>,
    conns: impl Iterator<Item = u64>,
    msg: &RelayMessage,
) {
    let frame = match encode_frame(msg) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to encode relay frame");
            return;
        }
    };
    for conn in conns {
        let Some(client) = clients.get(&conn) else {
            continue;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = client.tx.try_send(frame.clone()) {
            warn!(conn = conn, "client queue full, frame dropped");
        }
    }
}

// ============================================================================
// RelayGroup (client side)
// ============================================================================

enum ClientCommand {
    Join(oneshot::Sender<Result<GroupSession>>),
    Broadcast(CausalMessage, oneshot::Sender<Result<()>>),
    Leave(oneshot::Sender<Result<()>>),
    Frame(RelayMessage),
    Closed,
}

/// Group membership through a [`RelayHub`]. Ids, slots and the clock width
/// are assigned by the hub.
pub struct RelayGroup {
    cmd_tx: mpsc::Sender<ClientCommand>,
    events: TakeOnce<GroupEvent>,
}

impl RelayGroup {
    /// Connects to the hub at `hub`; the document is joined by
    /// [`GroupTransport::join`].
    pub async fn connect(
        hub: &PeerAddr,
        user_name: impl Into<String>,
        document_title: impl Into<String>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(
            crate::transport::CONNECT_TIMEOUT,
            TcpStream::connect((hub.host.as_str(), hub.port)),
        )
        .await
        .with_context(|| format!("connection to hub {} timed out", hub))?
        .with_context(|| format!("failed to connect to hub {}", hub))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(write_frames(write, writer_rx));

        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = {
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                let frames_tx = cmd_tx.clone();
                read_relay_frames(read, move |msg| {
                    let tx = frames_tx.clone();
                    async move { tx.send(ClientCommand::Frame(msg)).await.is_ok() }
                })
                .await;
                let _ = cmd_tx.send(ClientCommand::Closed).await;
            })
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let actor = RelayClientActor {
            request: RelayJoinRequest {
                user_name: user_name.into(),
                document_title: document_title.into(),
            },
            writer: Some(writer_tx),
            reader,
            pending_join: None,
            joined: false,
            event_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            events: tokio::sync::Mutex::new(Some(event_rx)),
        })
    }
}

#[async_trait]
impl GroupTransport for RelayGroup {
    async fn join(&self) -> Result<GroupSession> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Join(tx))
            .await
            .map_err(|_| anyhow::anyhow!("relay client closed"))?;
        tokio::time::timeout(RELAY_JOIN_TIMEOUT, rx)
            .await
            .context("timed out joining document")?
            .map_err(|_| anyhow::anyhow!("relay client closed"))?
    }

    async fn broadcast(&self, message: CausalMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Broadcast(message, tx))
            .await
            .map_err(|_| anyhow::anyhow!("relay client closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("relay client closed"))?
    }

    async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Leave(tx))
            .await
            .map_err(|_| anyhow::anyhow!("relay client closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("relay client closed"))?
    }

    async fn events(&self) -> Result<mpsc::Receiver<GroupEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("group event receiver already taken")
    }
}

struct RelayClientActor {
    request: RelayJoinRequest,
    writer: Option<mpsc::Sender<Vec<u8>>>,
    reader: JoinHandle<()>,
    pending_join: Option<oneshot::Sender<Result<GroupSession>>>,
    joined: bool,
    event_tx: mpsc::Sender<GroupEvent>,
}

impl RelayClientActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ClientCommand::Join(reply) => self.handle_join(reply).await,
                ClientCommand::Broadcast(message, reply) => {
                    let _ = reply.send(self.handle_broadcast(message).await);
                }
                ClientCommand::Leave(reply) => {
                    self.writer = None;
                    self.reader.abort();
                    self.joined = false;
                    info!(document = %self.request.document_title, "left document");
                    let _ = reply.send(Ok(()));
                    break;
                }
                ClientCommand::Frame(msg) => self.handle_frame(msg).await,
                ClientCommand::Closed => {
                    warn!("hub closed the connection");
                    self.writer = None;
                    self.joined = false;
                    if let Some(reply) = self.pending_join.take() {
                        let _ = reply.send(Err(anyhow::anyhow!("hub closed the connection")));
                    }
                }
            }
        }
    }

    async fn handle_join(&mut self, reply: oneshot::Sender<Result<GroupSession>>) {
        if self.joined || self.pending_join.is_some() {
            let _ = reply.send(Err(anyhow::anyhow!("document already joined")));
            return;
        }
        match self.write(&RelayMessage::JoinReq(self.request.clone())).await {
            Ok(()) => self.pending_join = Some(reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn handle_broadcast(&self, message: CausalMessage) -> Result<()> {
        if !self.joined {
            anyhow::bail!("document not joined");
        }
        let data = serde_json::to_value(message)?;
        self.write(&RelayMessage::Msg(data)).await
    }

    async fn handle_frame(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::JoinResp(response) => {
                let Some(reply) = self.pending_join.take() else {
                    debug!("unsolicited join response, ignoring");
                    return;
                };
                self.joined = true;
                info!(
                    id = %response.id,
                    document = %response.document_title,
                    users = response.known_users.len(),
                    "joined document"
                );
                let _ = reply.send(Ok(GroupSession {
                    width: response.r as usize,
                    members: response
                        .known_users
                        .into_iter()
                        .map(|u| Member {
                            id: u.id,
                            name: Some(u.name),
                        })
                        .collect(),
                    id: response.id,
                    entries: response.entries,
                    name: Some(response.name),
                    document_title: Some(response.document_title),
                }));
            }
            RelayMessage::Msg(data) => match serde_json::from_value::<CausalMessage>(data) {
                Ok(message) => {
                    let _ = self.event_tx.send(GroupEvent::Message(message)).await;
                }
                Err(e) => warn!(error = %e, "malformed relayed message, ignoring"),
            },
            RelayMessage::UserConnected(user) => {
                let member = Member {
                    id: user.id,
                    name: Some(user.name),
                };
                let _ = self.event_tx.send(GroupEvent::MemberJoined(member)).await;
            }
            RelayMessage::UserDisconnected(left) => {
                let _ = self.event_tx.send(GroupEvent::MemberLeft(left.id)).await;
            }
            RelayMessage::JoinReq(_) => debug!("join request from hub, ignoring"),
        }
    }

    async fn write(&self, msg: &RelayMessage) -> Result<()> {
        let writer = self.writer.as_ref().context("hub connection closed")?;
        let frame = encode_frame(msg).context("failed to encode relay frame")?;
        writer
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("hub connection closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qvc::QuasiVectorClock;
    use serde_json::json;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct CountingIds(u64);

    impl IdSource for CountingIds {
        fn next_id(&mut self) -> String {
            self.0 += 1;
            format!("user-{}", self.0)
        }
    }

    async fn hub() -> RelayHub {
        RelayHub::bind_with_ids(
            &PeerAddr::new("127.0.0.1", 0),
            HubConfig::default(),
            Box::new(CountingIds(0)),
        )
        .await
        .unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<GroupEvent>) -> GroupEvent {
        tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for group event")
            .expect("event stream closed")
    }

    fn message(session: &GroupSession, body: &str) -> CausalMessage {
        let mut qvc = QuasiVectorClock::new(session.width, &session.entries).unwrap();
        qvc.increment();
        CausalMessage {
            qvc,
            msg: json!(body),
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = HubConfig {
            k: 0,
            ..Default::default()
        };
        assert!(RelayHub::bind(&PeerAddr::new("127.0.0.1", 0), config).await.is_err());
    }

    #[tokio::test]
    async fn join_assigns_id_and_slots() {
        let hub = hub().await;
        let alice = RelayGroup::connect(&hub.local_addr(), "alice", "notes").await.unwrap();
        let session = alice.join().await.unwrap();

        assert_eq!(session.id, "user-1");
        assert_eq!(session.width, 101);
        assert_eq!(session.entries.len(), DEFAULT_HUB_K);
        assert!(session.entries.iter().all(|&e| e < 101));
        assert!(session.members.is_empty());
        assert_eq!(session.name.as_deref(), Some("alice"));
        assert_eq!(session.document_title.as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn messages_reach_others_and_announcements_flow() {
        let hub = hub().await;
        let alice = RelayGroup::connect(&hub.local_addr(), "alice", "notes").await.unwrap();
        let mut alice_events = alice.events().await.unwrap();
        let alice_session = alice.join().await.unwrap();

        let bob = RelayGroup::connect(&hub.local_addr(), "bob", "notes").await.unwrap();
        let mut bob_events = bob.events().await.unwrap();
        let bob_session = bob.join().await.unwrap();
        assert_eq!(
            bob_session.members,
            vec![Member {
                id: alice_session.id.clone(),
                name: Some("alice".to_string()),
            }]
        );
        assert_eq!(
            next(&mut alice_events).await,
            GroupEvent::MemberJoined(Member {
                id: bob_session.id.clone(),
                name: Some("bob".to_string()),
            })
        );

        let sent = message(&alice_session, "hello");
        alice.broadcast(sent.clone()).await.unwrap();
        assert_eq!(next(&mut bob_events).await, GroupEvent::Message(sent));

        bob.leave().await.unwrap();
        assert_eq!(
            next(&mut alice_events).await,
            GroupEvent::MemberLeft(bob_session.id)
        );
    }

    #[tokio::test]
    async fn late_joiner_gets_history_replay() {
        let hub = hub().await;
        let alice = RelayGroup::connect(&hub.local_addr(), "alice", "doc").await.unwrap();
        let session = alice.join().await.unwrap();
        let first = message(&session, "one");
        let second = message(&session, "two");
        alice.broadcast(first.clone()).await.unwrap();
        alice.broadcast(second.clone()).await.unwrap();

        tokio::time::timeout(TEST_TIMEOUT, async {
            while hub.documents().await.first().map(|d| d.history) != Some(2) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("history not recorded");

        let carol = RelayGroup::connect(&hub.local_addr(), "carol", "doc").await.unwrap();
        let mut events = carol.events().await.unwrap();
        carol.join().await.unwrap();
        assert_eq!(next(&mut events).await, GroupEvent::Message(first));
        assert_eq!(next(&mut events).await, GroupEvent::Message(second));
    }

    #[tokio::test]
    async fn documents_are_isolated_and_deleted_when_empty() {
        let hub = hub().await;
        let a = RelayGroup::connect(&hub.local_addr(), "a", "one").await.unwrap();
        let b = RelayGroup::connect(&hub.local_addr(), "b", "two").await.unwrap();
        let session_a = a.join().await.unwrap();
        let session_b = b.join().await.unwrap();
        assert!(session_a.members.is_empty());
        assert!(session_b.members.is_empty());

        let mut docs = hub.documents().await;
        docs.sort_by(|x, y| x.title.cmp(&y.title));
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].users, 1);

        a.leave().await.unwrap();
        b.leave().await.unwrap();
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !hub.documents().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("documents not deleted");
    }

    #[tokio::test]
    async fn broadcast_before_join_fails() {
        let hub = hub().await;
        let alice = RelayGroup::connect(&hub.local_addr(), "alice", "doc").await.unwrap();
        let qvc = QuasiVectorClock::new(101, &[0]).unwrap();
        let early = CausalMessage {
            qvc,
            msg: json!("early"),
        };
        assert!(alice.broadcast(early).await.is_err());
    }
}
