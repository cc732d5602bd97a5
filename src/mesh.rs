//! # Full-Mesh Group
//!
//! Decentralized [`GroupTransport`]: every member keeps a link to every other
//! member and broadcasts by sending to each of them directly.
//!
//! ## Join Protocol
//!
//! ```text
//! joiner                     contact                    other members
//!   │ ── JOIN_REQ ──────────► │                                │
//!   │ ◄── JOIN_RESP{ids, h} ─ │ (records joiner as a member)   │
//!   │ ── connect ───────────────────────────────────────────► │
//!   │ ── JOINED ────────────► │ ── ... ──────────────────────► │
//! ```
//!
//! The founder of a group draws the [`EntriesHash`] when the group is created
//! and is joined immediately, with no members. A joiner's members are the
//! listed ids it could reach plus its contact; unreachable ids are logged
//! and skipped.
//!
//! ## Membership
//!
//! Members are keyed by listening address. `QUIT` or a closed link removes a
//! member; `JOINED` from an unknown peer adds one.
//!
//! The actor never waits on outbound traffic: broadcasts are resolved to a
//! fan-out job that the caller queues, and protocol notices are queued
//! without blocking. It keeps reading inbound messages even while links to
//! slow members are backed up.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::entries_hash::{EntriesHash, EntriesHashGenerator};
use crate::identity::PeerAddr;
use crate::messages::{CausalMessage, JoinResponse, MeshMessage, PBCAST};
use crate::protocols::{
    GroupEvent, GroupSession, GroupTransport, Inbound, LinkEvent, Member, Subscription, Transport,
};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<T>>>;

/// Time allowed for the contact to answer and for member links to open.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Group events buffered for the consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts queued for the fan-out worker.
const FANOUT_QUEUE_CAPACITY: usize = 1024;

/// Time allowed for `QUIT` to reach the members when leaving.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a mesh group is entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshMode {
    /// Create a new group sized for about `r` members with `k` slots each.
    Found { r: u64, k: usize },
    /// Join the group of the member listening at this address.
    Join(PeerAddr),
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Join(oneshot::Sender<Result<GroupSession>>),
    JoinFailed(anyhow::Error),
    JoinConnected {
        contact: PeerAddr,
        reached: Vec<PeerAddr>,
    },
    Broadcast(CausalMessage, oneshot::Sender<Result<Outgoing>>),
    Members(oneshot::Sender<Vec<PeerAddr>>),
    Leave(oneshot::Sender<Result<()>>),
}

/// One fan-out job: the same payload to every target, in order.
struct Outgoing {
    targets: Vec<PeerAddr>,
    data: Value,
    done: Option<oneshot::Sender<()>>,
}

// ============================================================================
// MeshGroup Handle
// ============================================================================

pub struct MeshGroup {
    cmd_tx: mpsc::Sender<Command>,
    fanout_tx: mpsc::Sender<Outgoing>,
    events: TakeOnce<GroupEvent>,
    join_timeout: Duration,
}

impl MeshGroup {
    /// Validates `mode` and starts listening for group traffic.
    ///
    /// Founding with invalid `r`/`k` or joining oneself fails here.
    pub async fn spawn<T: Transport>(transport: Arc<T>, mode: MeshMode) -> Result<Self> {
        let local = transport.local_addr();
        let hash = match &mode {
            MeshMode::Found { r, k } => Some(
                EntriesHashGenerator::default()
                    .generate(*r, *k)
                    .context("invalid group parameters")?,
            ),
            MeshMode::Join(contact) => {
                if *contact == local {
                    anyhow::bail!("cannot join a group through this peer's own address");
                }
                None
            }
        };

        let inbound = transport
            .subscribe(PBCAST, None)
            .await
            .context("failed to subscribe to group traffic")?;
        let links = transport.link_events();

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (fanout_tx, fanout_rx) = mpsc::channel(FANOUT_QUEUE_CAPACITY);

        tokio::spawn(fan_out(transport.clone(), fanout_rx));

        let actor = MeshActor {
            transport,
            local,
            mode,
            hash,
            joined: false,
            pending_join: None,
            members: BTreeSet::new(),
            event_tx,
            fanout_tx: fanout_tx.clone(),
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, inbound, links));

        Ok(Self {
            cmd_tx,
            fanout_tx,
            events: tokio::sync::Mutex::new(Some(event_rx)),
            join_timeout: JOIN_TIMEOUT,
        })
    }

    /// Replaces [`JOIN_TIMEOUT`] for this group.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Current members, excluding this peer.
    pub async fn members(&self) -> Vec<PeerAddr> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Members(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[async_trait]
impl GroupTransport for MeshGroup {
    async fn join(&self) -> Result<GroupSession> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Join(tx))
            .await
            .map_err(|_| anyhow::anyhow!("mesh actor closed"))?;
        match tokio::time::timeout(self.join_timeout, rx).await {
            Ok(result) => result.map_err(|_| anyhow::anyhow!("mesh actor closed"))?,
            Err(_) => {
                // Drop the pending join so a late response cannot complete it.
                let _ = self
                    .cmd_tx
                    .send(Command::JoinFailed(anyhow::anyhow!("join timed out")))
                    .await;
                anyhow::bail!("timed out joining group")
            }
        }
    }

    async fn broadcast(&self, message: CausalMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Broadcast(message, tx))
            .await
            .map_err(|_| anyhow::anyhow!("mesh actor closed"))?;
        let job = rx
            .await
            .map_err(|_| anyhow::anyhow!("mesh actor closed"))??;
        self.fanout_tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("fan-out worker stopped"))
    }

    async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Leave(tx))
            .await
            .map_err(|_| anyhow::anyhow!("mesh actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh actor closed"))?
    }

    async fn events(&self) -> Result<mpsc::Receiver<GroupEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("group event receiver already taken")
    }
}

// ============================================================================
// Mesh Actor
// ============================================================================

struct MeshActor<T: Transport> {
    transport: Arc<T>,
    local: PeerAddr,
    mode: MeshMode,
    hash: Option<EntriesHash>,
    joined: bool,
    pending_join: Option<oneshot::Sender<Result<GroupSession>>>,
    members: BTreeSet<PeerAddr>,
    event_tx: mpsc::Sender<GroupEvent>,
    fanout_tx: mpsc::Sender<Outgoing>,
    cmd_tx: mpsc::Sender<Command>,
}

impl<T: Transport> MeshActor<T> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound: Subscription,
        mut links: broadcast::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Join(reply)) => self.handle_join(reply),
                        Some(Command::JoinFailed(e)) => {
                            if let Some(reply) = self.pending_join.take() {
                                debug!(error = %e, "join abandoned");
                                let _ = reply.send(Err(e));
                            }
                        }
                        Some(Command::JoinConnected { contact, reached }) => {
                            self.complete_join(contact, reached).await;
                        }
                        Some(Command::Broadcast(message, reply)) => {
                            let _ = reply.send(self.handle_broadcast(message));
                        }
                        Some(Command::Members(reply)) => {
                            let _ = reply.send(self.members.iter().cloned().collect());
                        }
                        Some(Command::Leave(reply)) => {
                            let _ = reply.send(self.handle_leave().await);
                            debug!("mesh actor quitting");
                            break;
                        }
                        None => {
                            debug!("mesh handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_inbound(msg).await,
                        None => {
                            debug!("group traffic subscription closed, actor quitting");
                            break;
                        }
                    }
                }
                event = links.recv() => {
                    match event {
                        Ok(LinkEvent::Closed(peer)) => self.remove_member(&peer).await,
                        Ok(LinkEvent::Opened(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "link events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
            }
        }
    }

    fn session(&self, hash: &EntriesHash) -> GroupSession {
        let id = self.local.to_string();
        GroupSession {
            entries: hash.hash(&id),
            width: hash.width(),
            members: self
                .members
                .iter()
                .map(|m| Member::anonymous(m.to_string()))
                .collect(),
            id,
            name: None,
            document_title: None,
        }
    }

    fn handle_join(&mut self, reply: oneshot::Sender<Result<GroupSession>>) {
        if self.joined || self.pending_join.is_some() {
            let _ = reply.send(Err(anyhow::anyhow!("group already joined")));
            return;
        }
        match self.mode.clone() {
            MeshMode::Found { .. } => {
                let Some(hash) = self.hash.as_ref() else {
                    let _ = reply.send(Err(anyhow::anyhow!("group parameters missing")));
                    return;
                };
                let session = self.session(hash);
                self.joined = true;
                info!(id = %session.id, m = hash.m(), k = hash.k(), "founded group");
                let _ = reply.send(Ok(session));
            }
            MeshMode::Join(contact) => {
                self.pending_join = Some(reply);
                let transport = self.transport.clone();
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let result = match serde_json::to_value(MeshMessage::JoinReq) {
                        Ok(data) => transport.send(&contact, PBCAST, data).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = result {
                        let e = e.context(format!("failed to reach contact {}", contact));
                        let _ = cmd_tx.send(Command::JoinFailed(e)).await;
                    }
                });
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let message: MeshMessage = match serde_json::from_value(inbound.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %inbound.from, error = %e, "malformed group message");
                return;
            }
        };
        let from = inbound.from;

        match message {
            MeshMessage::JoinReq => self.handle_join_request(from).await,
            MeshMessage::JoinResp(response) => self.handle_join_response(from, response),
            MeshMessage::Msg(message) => {
                trace!(peer = %from, "group message");
                let _ = self.event_tx.send(GroupEvent::Message(message)).await;
            }
            MeshMessage::Joined => self.add_member(from).await,
            MeshMessage::Quit => self.remove_member(&from).await,
        }
    }

    async fn handle_join_request(&mut self, from: PeerAddr) {
        let Some(hash) = self.hash.clone().filter(|_| self.joined) else {
            debug!(peer = %from, "join request before this peer joined, ignoring");
            return;
        };
        let ids = self.members.iter().filter(|m| **m != from).cloned().collect();
        let response = MeshMessage::JoinResp(JoinResponse {
            ids,
            entries_hash: hash,
        });
        match serde_json::to_value(&response) {
            Ok(data) => self.queue(vec![from.clone()], data, None),
            Err(e) => warn!(error = %e, "failed to encode join response"),
        }
        self.add_member(from).await;
    }

    fn handle_join_response(&mut self, from: PeerAddr, response: JoinResponse) {
        let MeshMode::Join(contact) = &self.mode else {
            return;
        };
        if self.pending_join.is_none() || from != *contact {
            debug!(peer = %from, "unexpected join response, ignoring");
            return;
        }
        let contact = contact.clone();
        self.hash = Some(response.entries_hash);

        let ids: Vec<PeerAddr> = response
            .ids
            .into_iter()
            .filter(|id| *id != self.local && *id != contact)
            .collect();
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut attempts = JoinSet::new();
            for id in ids {
                let transport = transport.clone();
                attempts.spawn(async move {
                    let result = transport.connect(&id).await;
                    (id, result)
                });
            }
            let mut reached = Vec::new();
            while let Some(done) = attempts.join_next().await {
                match done {
                    Ok((id, Ok(()))) => reached.push(id),
                    Ok((id, Err(e))) => warn!(peer = %id, error = %e, "failed to connect to group member"),
                    Err(e) => warn!(error = %e, "connection attempt panicked"),
                }
            }
            let _ = cmd_tx.send(Command::JoinConnected { contact, reached }).await;
        });
    }

    async fn complete_join(&mut self, contact: PeerAddr, reached: Vec<PeerAddr>) {
        let Some(reply) = self.pending_join.take() else {
            debug!(peer = %contact, "join no longer pending, ignoring");
            return;
        };
        if reply.is_closed() {
            debug!(peer = %contact, "join caller gone, ignoring");
            return;
        }
        let Some(hash) = self.hash.clone() else {
            let _ = reply.send(Err(anyhow::anyhow!("join response carried no group parameters")));
            return;
        };

        self.members.insert(contact);
        self.members.extend(reached);
        self.joined = true;

        match serde_json::to_value(MeshMessage::Joined) {
            Ok(data) => {
                let targets = self.members.iter().cloned().collect();
                self.queue(targets, data, None);
            }
            Err(e) => warn!(error = %e, "failed to encode joined notice"),
        }

        let session = self.session(&hash);
        info!(id = %session.id, members = self.members.len(), "joined group");
        let _ = reply.send(Ok(session));
    }

    fn handle_broadcast(&self, message: CausalMessage) -> Result<Outgoing> {
        if !self.joined {
            anyhow::bail!("group not joined");
        }
        Ok(Outgoing {
            targets: self.members.iter().cloned().collect(),
            data: serde_json::to_value(MeshMessage::Msg(message))?,
            done: None,
        })
    }

    async fn handle_leave(&mut self) -> Result<()> {
        if !self.joined {
            return Ok(());
        }
        let data = serde_json::to_value(MeshMessage::Quit)?;
        let targets = std::mem::take(&mut self.members).into_iter().collect();
        let (done_tx, done_rx) = oneshot::channel();
        self.queue(targets, data, Some(done_tx));
        if tokio::time::timeout(LEAVE_TIMEOUT, done_rx).await.is_err() {
            warn!("quit notice not sent to every member");
        }
        self.joined = false;
        info!("left group");
        Ok(())
    }

    /// Queues a protocol notice. When the fan-out queue is full the job is
    /// handed to a task so the actor keeps serving inbound traffic.
    fn queue(&self, targets: Vec<PeerAddr>, data: Value, done: Option<oneshot::Sender<()>>) {
        let job = Outgoing {
            targets,
            data,
            done,
        };
        match self.fanout_tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                let fanout_tx = self.fanout_tx.clone();
                tokio::spawn(async move {
                    let _ = fanout_tx.send(job).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => warn!("fan-out worker stopped"),
        }
    }

    async fn add_member(&mut self, peer: PeerAddr) {
        if peer == self.local || !self.members.insert(peer.clone()) {
            return;
        }
        debug!(peer = %peer, "member joined");
        let _ = self
            .event_tx
            .send(GroupEvent::MemberJoined(Member::anonymous(peer.to_string())))
            .await;
    }

    async fn remove_member(&mut self, peer: &PeerAddr) {
        if !self.members.remove(peer) {
            return;
        }
        debug!(peer = %peer, "member left");
        let _ = self
            .event_tx
            .send(GroupEvent::MemberLeft(peer.to_string()))
            .await;
    }
}

/// Sends queued jobs one at a time so members see broadcasts in order.
async fn fan_out<T: Transport>(transport: Arc<T>, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(job) = rx.recv().await {
        for target in &job.targets {
            if let Err(e) = transport.send(target, PBCAST, job.data.clone()).await {
                debug!(peer = %target, error = %e, "failed to send group message");
            }
        }
        if let Some(done) = job.done {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;

    async fn transport() -> Arc<TcpTransport> {
        Arc::new(TcpTransport::bind(&PeerAddr::new("127.0.0.1", 0)).await.unwrap())
    }

    #[tokio::test]
    async fn found_with_invalid_parameters_fails() {
        let t = transport().await;
        assert!(MeshGroup::spawn(t.clone(), MeshMode::Found { r: 100, k: 0 }).await.is_err());
        assert!(MeshGroup::spawn(t, MeshMode::Found { r: 1, k: 1 }).await.is_err());
    }

    #[tokio::test]
    async fn joining_through_self_fails() {
        let t = transport().await;
        let local = t.local_addr();
        assert!(MeshGroup::spawn(t, MeshMode::Join(local)).await.is_err());
    }

    #[tokio::test]
    async fn founder_session_has_no_members() {
        let t = transport().await;
        let local = t.local_addr();
        let group = MeshGroup::spawn(t, MeshMode::Found { r: 100, k: 5 }).await.unwrap();
        let session = group.join().await.unwrap();

        assert_eq!(session.id, local.to_string());
        assert_eq!(session.width, 101);
        assert_eq!(session.entries.len(), 5);
        assert!(session.members.is_empty());
        assert!(group.join().await.is_err());
    }

    #[tokio::test]
    async fn broadcast_before_join_is_rejected() {
        let t = transport().await;
        let group = MeshGroup::spawn(t, MeshMode::Found { r: 10, k: 2 }).await.unwrap();
        let message = CausalMessage {
            qvc: crate::qvc::QuasiVectorClock::new(11, &[0]).unwrap(),
            msg: serde_json::json!("early"),
        };
        assert!(group.broadcast(message).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_contact_fails_join() {
        let t = transport().await;
        let group = MeshGroup::spawn(t, MeshMode::Join(PeerAddr::new("127.0.0.1", 1)))
            .await
            .unwrap();
        assert!(group.join().await.is_err());
    }

    #[tokio::test]
    async fn late_join_response_after_timeout_is_ignored() {
        use crate::messages::{decode, encode_frame, read_frame, Envelope};
        use tokio::io::{AsyncWriteExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};

        // A contact that accepts the request but answers only after the
        // joiner has given up.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let contact = PeerAddr::new("127.0.0.1", silent.local_addr().unwrap().port());

        let t = transport().await;
        let joiner_addr = t.local_addr();
        let group = MeshGroup::spawn(t, MeshMode::Join(contact.clone()))
            .await
            .unwrap()
            .with_join_timeout(Duration::from_millis(200));

        let accepted = tokio::spawn(async move {
            let (stream, _) = silent.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            let request: Envelope = decode(&frame).unwrap();
            (reader, request)
        });

        assert!(group.join().await.is_err());
        let (_held, request) = accepted.await.unwrap();
        assert_eq!(request.sender(), joiner_addr);

        let response = MeshMessage::JoinResp(JoinResponse {
            ids: Vec::new(),
            entries_hash: EntriesHashGenerator::default().generate(10, 2).unwrap(),
        });
        let frame = encode_frame(&Envelope {
            header: PBCAST.to_string(),
            data: serde_json::to_value(&response).unwrap(),
            host: contact.host.clone(),
            port: contact.port,
        })
        .unwrap();
        let mut late = TcpStream::connect(("127.0.0.1", joiner_addr.port))
            .await
            .unwrap();
        late.write_all(&frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(group.members().await.is_empty());
        let message = CausalMessage {
            qvc: crate::qvc::QuasiVectorClock::new(11, &[0]).unwrap(),
            msg: serde_json::json!("after timeout"),
        };
        assert!(group.broadcast(message).await.is_err());
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let t = transport().await;
        let group = MeshGroup::spawn(t, MeshMode::Found { r: 10, k: 2 }).await.unwrap();
        assert!(group.events().await.is_ok());
        assert!(group.events().await.is_err());
    }

    #[tokio::test]
    async fn joiner_learns_members_and_contact_sees_it() {
        let founder_t = transport().await;
        let founder_addr = founder_t.local_addr();
        let founder = MeshGroup::spawn(founder_t, MeshMode::Found { r: 100, k: 5 })
            .await
            .unwrap();
        let mut founder_events = founder.events().await.unwrap();
        founder.join().await.unwrap();

        let joiner_t = transport().await;
        let joiner_addr = joiner_t.local_addr();
        let joiner = MeshGroup::spawn(joiner_t, MeshMode::Join(founder_addr.clone()))
            .await
            .unwrap();
        let session = joiner.join().await.unwrap();

        assert_eq!(session.width, 101);
        assert_eq!(session.members, vec![Member::anonymous(founder_addr.to_string())]);

        let event = tokio::time::timeout(Duration::from_secs(5), founder_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, GroupEvent::MemberJoined(Member::anonymous(joiner_addr.to_string())));
        assert_eq!(founder.members().await, vec![joiner_addr]);
    }
}
