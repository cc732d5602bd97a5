//! # Probabilistic Causal Broadcast
//!
//! Application-facing broadcast over any [`GroupTransport`]. Messages carry a
//! [`QuasiVectorClock`](crate::qvc::QuasiVectorClock) and are delivered in
//! causal order with high probability; deliveries whose clock looks stale
//! are flagged rather than dropped.
//!
//! ## Lifecycle
//!
//! ```text
//! JOINING ──(session established)──► READY
//!    │
//!    └──(join failed)──► JoinFailed event, actor stops
//! ```
//!
//! While joining, local events, outgoing broadcasts and received messages
//! are queued. On READY the `Ready` event is emitted, then local events are
//! delivered, queued broadcasts are stamped and sent, and received messages
//! go through causal delivery, in that order.
//!
//! The actor never waits on the group transport: stamped messages are handed
//! back to the caller of [`CausalBroadcast::send`], which broadcasts them.
//! A group that is itself waiting to hand the actor an inbound message can
//! therefore always make progress.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::causal::{CausalOrder, DEFAULT_DELIVERED_HISTORY, DEFAULT_MAX_PENDING, Delivery};
use crate::messages::CausalMessage;
use crate::protocols::{GroupEvent, GroupSession, GroupTransport, Member};
use crate::qvc::QuasiVectorClock;

/// Events buffered per subscriber.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Messages queued while the group join is in progress.
/// SECURITY: Further local events and broadcasts are rejected until READY;
/// further received messages drop the oldest queued one.
pub const DEFAULT_MAX_QUEUED: usize = 10_000;

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Delivered clocks remembered for anomaly detection.
    pub history_capacity: usize,
    /// Received messages waiting for their causal predecessors.
    pub max_pending: usize,
    /// Per-queue bound while joining.
    pub max_queued: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_DELIVERED_HISTORY,
            max_pending: DEFAULT_MAX_PENDING,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BroadcastEvent {
    /// The session is established; `known` are the members at that time.
    Ready { id: String, known: Vec<Member> },
    Deliver(Delivery),
    MemberJoined(Member),
    MemberLeft(String),
    JoinFailed(String),
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    LocalSend(Value, oneshot::Sender<Result<()>>),
    /// Replies with the stamped message, or `None` if it was queued.
    Send(Value, oneshot::Sender<Result<Option<CausalMessage>>>),
    Subscribe(oneshot::Sender<mpsc::Receiver<BroadcastEvent>>),
    Session(oneshot::Sender<Option<(String, QuasiVectorClock)>>),
    Quit(oneshot::Sender<()>),
}

// ============================================================================
// CausalBroadcast Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct CausalBroadcast {
    cmd_tx: mpsc::Sender<Command>,
    group: Arc<dyn GroupTransport>,
}

impl CausalBroadcast {
    /// Starts joining `group` and returns the handle with a first event
    /// subscription, so that `Ready` cannot be missed.
    pub async fn spawn<G: GroupTransport>(
        group: Arc<G>,
        config: BroadcastConfig,
    ) -> Result<(Self, mpsc::Receiver<BroadcastEvent>)> {
        let group_events = group.events().await.context("group events unavailable")?;
        let group: Arc<dyn GroupTransport> = group;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (join_tx, join_rx) = oneshot::channel();

        {
            let group = group.clone();
            tokio::spawn(async move {
                let _ = join_tx.send(group.join().await);
            });
        }

        let actor = BroadcastActor {
            group: group.clone(),
            config,
            phase: Phase::Joining(JoinQueues::default()),
            subscribers: vec![event_tx],
        };
        tokio::spawn(actor.run(cmd_rx, group_events, join_rx));

        Ok((Self { cmd_tx, group }, event_rx))
    }

    /// Delivers `msg` locally and advances the local clock.
    pub async fn local_send(&self, msg: Value) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LocalSend(msg, tx))
            .await
            .map_err(|_| anyhow::anyhow!("broadcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("broadcast actor closed"))?
    }

    /// Stamps `msg` with the current clock and sends it to the group. The
    /// clock is not advanced; pair with [`Self::local_send`] for a new event.
    /// While joining, the message is queued and sent once READY.
    pub async fn send(&self, msg: Value) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send(msg, tx))
            .await
            .map_err(|_| anyhow::anyhow!("broadcast actor closed"))?;
        let stamped = rx
            .await
            .map_err(|_| anyhow::anyhow!("broadcast actor closed"))??;
        match stamped {
            Some(message) => self.group.broadcast(message).await,
            None => Ok(()),
        }
    }

    /// Additional event stream, starting from the next event.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastEvent>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(tx))
            .await
            .map_err(|_| anyhow::anyhow!("broadcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("broadcast actor closed"))
    }

    /// Session id, once READY.
    pub async fn id(&self) -> Option<String> {
        self.session().await.map(|(id, _)| id)
    }

    /// Snapshot of the local clock, once READY.
    pub async fn clock(&self) -> Option<QuasiVectorClock> {
        self.session().await.map(|(_, clock)| clock)
    }

    pub async fn is_ready(&self) -> bool {
        self.session().await.is_some()
    }

    /// Stops the actor and leaves the group.
    pub async fn quit(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Quit(tx))
            .await
            .map_err(|_| anyhow::anyhow!("broadcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("broadcast actor closed"))?;
        self.group.leave().await
    }

    async fn session(&self) -> Option<(String, QuasiVectorClock)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Session(tx)).await.ok()?;
        rx.await.ok().flatten()
    }
}

// ============================================================================
// Broadcast Actor
// ============================================================================

#[derive(Default)]
struct JoinQueues {
    local: VecDeque<Value>,
    outgoing: VecDeque<Value>,
    received: VecDeque<CausalMessage>,
}

enum Phase {
    Joining(JoinQueues),
    Ready { id: String, order: CausalOrder },
}

struct BroadcastActor {
    group: Arc<dyn GroupTransport>,
    config: BroadcastConfig,
    phase: Phase,
    subscribers: Vec<mpsc::Sender<BroadcastEvent>>,
}

impl BroadcastActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut group_events: mpsc::Receiver<GroupEvent>,
        mut join_rx: oneshot::Receiver<Result<GroupSession>>,
    ) {
        let mut joining = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::LocalSend(msg, reply)) => {
                            let _ = reply.send(self.handle_local_send(msg).await);
                        }
                        Some(Command::Send(msg, reply)) => {
                            let _ = reply.send(self.handle_send(msg));
                        }
                        Some(Command::Subscribe(reply)) => {
                            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
                            self.subscribers.push(tx);
                            let _ = reply.send(rx);
                        }
                        Some(Command::Session(reply)) => {
                            let session = match &self.phase {
                                Phase::Ready { id, order } => Some((id.clone(), order.clock().clone())),
                                Phase::Joining(_) => None,
                            };
                            let _ = reply.send(session);
                        }
                        Some(Command::Quit(reply)) => {
                            let _ = reply.send(());
                            debug!("broadcast actor quitting");
                            break;
                        }
                        None => {
                            debug!("broadcast handle dropped, actor quitting");
                            let group = self.group.clone();
                            tokio::spawn(async move {
                                let _ = group.leave().await;
                            });
                            break;
                        }
                    }
                }
                joined = &mut join_rx, if joining => {
                    joining = false;
                    let result = joined
                        .map_err(|_| anyhow::anyhow!("join task aborted"))
                        .and_then(|r| r);
                    match result {
                        Ok(session) => {
                            if let Err(e) = self.become_ready(session).await {
                                warn!(error = %e, "group session unusable");
                                self.emit(BroadcastEvent::JoinFailed(format!("{:#}", e))).await;
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to join group");
                            self.emit(BroadcastEvent::JoinFailed(format!("{:#}", e))).await;
                            break;
                        }
                    }
                }
                Some(event) = group_events.recv() => {
                    self.handle_group_event(event).await;
                }
            }
        }
    }

    async fn become_ready(&mut self, session: GroupSession) -> Result<()> {
        let clock = QuasiVectorClock::new(session.width, &session.entries)
            .context("invalid clock entries for session")?;
        let order = CausalOrder::new(clock, self.config.history_capacity, self.config.max_pending);

        let queues = match std::mem::replace(
            &mut self.phase,
            Phase::Ready {
                id: session.id.clone(),
                order,
            },
        ) {
            Phase::Joining(queues) => queues,
            Phase::Ready { .. } => JoinQueues::default(),
        };

        info!(id = %session.id, members = session.members.len(), "broadcast ready");
        self.emit(BroadcastEvent::Ready {
            id: session.id,
            known: session.members,
        })
        .await;

        for msg in queues.local {
            self.handle_local_send(msg).await?;
        }
        let outgoing: Vec<CausalMessage> = queues
            .outgoing
            .into_iter()
            .filter_map(|msg| self.handle_send(msg).ok().flatten())
            .collect();
        if !outgoing.is_empty() {
            let group = self.group.clone();
            tokio::spawn(async move {
                for message in outgoing {
                    if let Err(e) = group.broadcast(message).await {
                        warn!(error = %e, "failed to send queued broadcast");
                    }
                }
            });
        }
        for message in queues.received {
            self.receive(message).await;
        }
        Ok(())
    }

    async fn handle_local_send(&mut self, msg: Value) -> Result<()> {
        let max_queued = self.config.max_queued;
        match &mut self.phase {
            Phase::Joining(queues) => {
                if queues.local.len() >= max_queued {
                    anyhow::bail!("local queue full while joining");
                }
                queues.local.push_back(msg);
            }
            Phase::Ready { order, .. } => {
                let delivery = order.local_event(msg);
                self.emit(BroadcastEvent::Deliver(delivery)).await;
            }
        }
        Ok(())
    }

    fn handle_send(&mut self, msg: Value) -> Result<Option<CausalMessage>> {
        let max_queued = self.config.max_queued;
        match &mut self.phase {
            Phase::Joining(queues) => {
                if queues.outgoing.len() >= max_queued {
                    anyhow::bail!("broadcast queue full while joining");
                }
                queues.outgoing.push_back(msg);
                Ok(None)
            }
            Phase::Ready { order, .. } => Ok(Some(order.stamp(msg))),
        }
    }

    async fn handle_group_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Message(message) => self.receive(message).await,
            GroupEvent::MemberJoined(member) => {
                self.emit(BroadcastEvent::MemberJoined(member)).await;
            }
            GroupEvent::MemberLeft(id) => {
                self.emit(BroadcastEvent::MemberLeft(id)).await;
            }
        }
    }

    async fn receive(&mut self, message: CausalMessage) {
        let max_queued = self.config.max_queued;
        let deliveries = match &mut self.phase {
            Phase::Joining(queues) => {
                if queues.received.len() >= max_queued {
                    queues.received.pop_front();
                    warn!(max = max_queued, "receive queue full while joining, dropped oldest");
                }
                queues.received.push_back(message);
                return;
            }
            Phase::Ready { order, .. } => order.receive(message),
        };
        for delivery in deliveries {
            if delivery.error {
                debug!(entries = ?delivery.entries, "delivered message with stale clock");
            }
            self.emit(BroadcastEvent::Deliver(delivery)).await;
        }
    }

    /// Sends to every live subscriber; closed ones are dropped.
    async fn emit(&mut self, event: BroadcastEvent) {
        let mut alive = Vec::with_capacity(self.subscribers.len());
        for tx in self.subscribers.drain(..) {
            if tx.send(event.clone()).await.is_ok() {
                alive.push(tx);
            }
        }
        self.subscribers = alive;
    }
}
