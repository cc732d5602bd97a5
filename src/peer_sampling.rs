//! # Peer Sampling Service
//!
//! Gossip-based membership: every node keeps a small [`View`] of peers and
//! periodically swaps part of it with one of them, so that views stay fresh,
//! bounded and well mixed under churn without any node knowing the whole
//! group.
//!
//! ## Exchange
//!
//! | Side | Trigger | Action |
//! |------|---------|--------|
//! | Active | every `gossip_period`, view non-empty | select a peer, send `PSS_REQ` with a buffer, merge the `PSS_RES` |
//! | Passive | incoming `PSS_REQ` | reply `PSS_RES` with a buffer, merge the request |
//!
//! After each merge every age grows by one.
//!
//! ## Merge Policy
//!
//! [`merge_views`] first moves the `heal_factor` oldest local entries to the
//! tail, appends the remote buffer and removes duplicates (freshest wins).
//! Excess entries are then evicted in three stages: up to `heal_factor` of
//! the oldest, up to `swap_factor` from the head, then the remainder at
//! random.
//!
//! ## Pending Responses
//!
//! A response is awaited on a single-use subscription registered before the
//! request is sent, bounded by `response_timeout`. The result is marshaled
//! back to the actor, which merges it into its current view.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::identity::PeerAddr;
use crate::messages::{GossipPayload, PSS_REQ, PSS_RES};
use crate::protocols::{Inbound, Subscription, Transport};
use crate::view::{DEFAULT_MAX_VIEW_SIZE, PeerDescriptor, View};

// ============================================================================
// Configuration
// ============================================================================

/// Probability of gossiping with the oldest entry instead of a random one.
pub const DEFAULT_P_SELECT_OLDEST: f64 = 0.75;

/// Stale entries evicted first when a merged view overflows.
pub const DEFAULT_HEAL_FACTOR: usize = 2;

/// Head entries evicted next when a merged view overflows.
pub const DEFAULT_SWAP_FACTOR: usize = 2;

/// Interval between active exchanges.
pub const DEFAULT_GOSSIP_PERIOD: Duration = Duration::from_secs(2);

/// How long an active exchange waits for its response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PeerSamplingConfig {
    pub max_view_size: usize,
    pub p_select_oldest: f64,
    pub heal_factor: usize,
    pub swap_factor: usize,
    pub gossip_period: Duration,
    pub response_timeout: Duration,
}

impl Default for PeerSamplingConfig {
    fn default() -> Self {
        Self {
            max_view_size: DEFAULT_MAX_VIEW_SIZE,
            p_select_oldest: DEFAULT_P_SELECT_OLDEST,
            heal_factor: DEFAULT_HEAL_FACTOR,
            swap_factor: DEFAULT_SWAP_FACTOR,
            gossip_period: DEFAULT_GOSSIP_PERIOD,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

// ============================================================================
// View Operations
// ============================================================================

/// Merges a remote buffer into a local view and trims it to capacity.
pub fn merge_views(local: &View, remote: &View, config: &PeerSamplingConfig) -> View {
    let merged = local
        .move_oldest_items(config.heal_factor)
        .push_all(remote.descriptors())
        .remove_duplicates();

    let excess = |v: &View| v.len().saturating_sub(config.max_view_size);

    let merged = merged.remove_oldest_items(config.heal_factor.min(excess(&merged)));
    let merged = merged.remove_head(config.swap_factor.min(excess(&merged)));
    merged.remove_at_random(excess(&merged))
}

/// Buffer sent to `recipient`: this node at age 0, then up to
/// `max_view_size / 2 - 1` entries favouring fresh ones.
pub fn construct_buffer(
    view: &View,
    local: &PeerAddr,
    recipient: &PeerAddr,
    config: &PeerSamplingConfig,
) -> View {
    let budget = (config.max_view_size / 2).saturating_sub(1);
    let items: Vec<PeerDescriptor> = view
        .permute()
        .move_oldest_items(config.heal_factor)
        .iter()
        .filter(|d| !d.same_peer(recipient))
        .take(budget)
        .cloned()
        .collect();

    View::from(vec![PeerDescriptor::fresh(local)]).push_all(&items)
}

/// Gossip target: usually the oldest entry, otherwise a random one.
pub fn select_peer(view: &View, config: &PeerSamplingConfig) -> Option<PeerDescriptor> {
    if view.is_empty() {
        return None;
    }
    let mut rng = rand::thread_rng();
    let oldest = if rng.gen_bool(config.p_select_oldest.clamp(0.0, 1.0)) {
        view.oldest_item()
    } else {
        None
    };
    let idx = oldest.unwrap_or_else(|| rng.gen_range(0..view.len()));
    view.get(idx).cloned()
}

/// Drops descriptors of `local` from a received buffer.
fn without_self(remote: View, local: &PeerAddr) -> View {
    View::from(
        remote
            .into_descriptors()
            .into_iter()
            .filter(|d| !d.same_peer(local))
            .collect::<Vec<_>>(),
    )
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    GetView(oneshot::Sender<View>),
    Join(PeerAddr, oneshot::Sender<Result<()>>),
    Quit,
}

/// Outcome of an active exchange, marshaled back into the actor.
struct Exchanged {
    target: PeerAddr,
    remote: View,
    reply: Option<oneshot::Sender<Result<()>>>,
}

// ============================================================================
// PeerSampling Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct PeerSampling {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerAddr,
}

impl PeerSampling {
    /// Starts the passive and active sides on `transport`.
    pub async fn spawn<T: Transport>(transport: Arc<T>, config: PeerSamplingConfig) -> Result<Self> {
        let requests = transport
            .subscribe(PSS_REQ, None)
            .await
            .context("failed to subscribe to gossip requests")?;
        let local = transport.local_addr();

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (exchanged_tx, exchanged_rx) = mpsc::channel(64);
        let actor = PeerSamplingActor::new(transport, config, exchanged_tx);
        tokio::spawn(actor.run(cmd_rx, requests, exchanged_rx));

        Ok(Self { cmd_tx, local })
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    /// Snapshot of the current view.
    pub async fn view(&self) -> View {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetView(tx)).await.is_err() {
            return View::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Runs one exchange with `contact` and merges its response.
    pub async fn join(&self, contact: PeerAddr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Join(contact, tx))
            .await
            .map_err(|_| anyhow::anyhow!("peer sampling actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("peer sampling actor closed"))?
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// PeerSampling Actor (owns the view)
// ============================================================================

struct PeerSamplingActor<T: Transport> {
    transport: Arc<T>,
    config: PeerSamplingConfig,
    local: PeerAddr,
    view: View,
    exchanged_tx: mpsc::Sender<Exchanged>,
}

impl<T: Transport> PeerSamplingActor<T> {
    fn new(transport: Arc<T>, config: PeerSamplingConfig, exchanged_tx: mpsc::Sender<Exchanged>) -> Self {
        let local = transport.local_addr();
        Self {
            transport,
            config,
            local,
            view: View::new(),
            exchanged_tx,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut requests: Subscription,
        mut exchanged_rx: mpsc::Receiver<Exchanged>,
    ) {
        let start = tokio::time::Instant::now() + self.config.gossip_period;
        let mut gossip = tokio::time::interval_at(start, self.config.gossip_period);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::GetView(reply)) => {
                            let _ = reply.send(self.view.clone());
                        }
                        Some(Command::Join(contact, reply)) => {
                            self.start_exchange(contact, Some(reply));
                        }
                        Some(Command::Quit) => {
                            debug!("peer sampling actor quitting");
                            break;
                        }
                        None => {
                            debug!("peer sampling handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                inbound = requests.recv() => {
                    match inbound {
                        Some(inbound) => self.handle_request(inbound),
                        None => {
                            debug!("gossip request subscription closed, actor quitting");
                            break;
                        }
                    }
                }
                Some(done) = exchanged_rx.recv() => {
                    self.merge(done.remote);
                    trace!(peer = %done.target, size = self.view.len(), "merged gossip response");
                    if let Some(reply) = done.reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                _ = gossip.tick() => {
                    self.gossip_round();
                }
            }
        }
    }

    fn merge(&mut self, remote: View) {
        let remote = without_self(remote, &self.local);
        self.view = merge_views(&self.view, &remote, &self.config).increase_age();
    }

    fn handle_request(&mut self, inbound: Inbound) {
        let payload: GossipPayload = match serde_json::from_value(inbound.data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %inbound.from, error = %e, "malformed gossip request");
                return;
            }
        };

        let buffer = construct_buffer(&self.view, &self.local, &inbound.from, &self.config);
        let transport = self.transport.clone();
        let to = inbound.from.clone();
        tokio::spawn(async move {
            let data = match serde_json::to_value(GossipPayload { view: buffer }) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "failed to encode gossip response");
                    return;
                }
            };
            if let Err(e) = transport.send(&to, PSS_RES, data).await {
                debug!(peer = %to, error = %e, "failed to send gossip response");
            }
        });

        self.merge(payload.view);
        trace!(peer = %inbound.from, size = self.view.len(), "merged gossip request");
    }

    fn gossip_round(&mut self) {
        let Some(target) = select_peer(&self.view, &self.config) else {
            return;
        };
        self.start_exchange(target.addr(), None);
    }

    /// Sends a request to `target` and awaits its response off the actor.
    fn start_exchange(&self, target: PeerAddr, reply: Option<oneshot::Sender<Result<()>>>) {
        let buffer = construct_buffer(&self.view, &self.local, &target, &self.config);
        let transport = self.transport.clone();
        let exchanged_tx = self.exchanged_tx.clone();
        let response_timeout = self.config.response_timeout;

        tokio::spawn(async move {
            match exchange(transport.as_ref(), &target, buffer, response_timeout).await {
                Ok(remote) => {
                    let _ = exchanged_tx
                        .send(Exchanged {
                            target,
                            remote,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    debug!(peer = %target, error = %e, "gossip exchange failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        });
    }
}

async fn exchange<T: Transport>(
    transport: &T,
    target: &PeerAddr,
    buffer: View,
    response_timeout: Duration,
) -> Result<View> {
    let mut response = transport
        .subscribe(PSS_RES, Some(target.clone()))
        .await?;

    let data = serde_json::to_value(GossipPayload { view: buffer })?;
    transport.send(target, PSS_REQ, data).await?;

    let inbound = tokio::time::timeout(response_timeout, response.recv())
        .await
        .with_context(|| format!("no gossip response from {} within {:?}", target, response_timeout))?
        .context("transport closed while awaiting gossip response")?;

    let payload: GossipPayload =
        serde_json::from_value(inbound.data).context("malformed gossip response")?;
    Ok(payload.view)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(port: u16, age: u32) -> PeerDescriptor {
        PeerDescriptor::new("127.0.0.1", port, age)
    }

    fn view_of(ports: impl IntoIterator<Item = (u16, u32)>) -> View {
        View::from(ports.into_iter().map(|(p, a)| d(p, a)).collect::<Vec<_>>())
    }

    fn has_duplicates(view: &View) -> bool {
        let mut seen = std::collections::HashSet::new();
        view.iter().any(|d| !seen.insert((d.host.clone(), d.port)))
    }

    #[test]
    fn merge_keeps_size_bounded() {
        let config = PeerSamplingConfig::default();
        let mut rng = rand::thread_rng();
        let mut local = view_of((0..10).map(|i| (i, i as u32)));

        for round in 0..200u16 {
            let remote = view_of(
                (0..rng.gen_range(1..=10)).map(|_| (rng.gen_range(0..40), rng.gen_range(0..20))),
            );
            local = merge_views(&local, &remote, &config).increase_age();
            assert!(local.len() <= config.max_view_size, "round {}", round);
            assert!(!has_duplicates(&local), "round {}", round);
        }
    }

    #[test]
    fn merge_prefers_fresh_duplicates() {
        let config = PeerSamplingConfig::default();
        let local = view_of([(1, 10), (2, 3)]);
        let remote = view_of([(1, 0), (3, 0)]);
        let merged = merge_views(&local, &remote, &config);
        assert_eq!(merged.len(), 3);
        let one = merged.iter().find(|d| d.port == 1).unwrap();
        assert_eq!(one.age, 0);
    }

    #[test]
    fn merge_evicts_stale_entries_first() {
        let config = PeerSamplingConfig::default();
        let mut entries: Vec<(u16, u32)> = (0..9).map(|i| (i, 1)).collect();
        entries.push((99, 50));
        let local = view_of(entries);
        let remote = view_of([(100, 0)]);

        let merged = merge_views(&local, &remote, &config);
        assert_eq!(merged.len(), 10);
        assert!(!merged.iter().any(|d| d.port == 99));
        assert!(merged.iter().any(|d| d.port == 100));
    }

    #[test]
    fn merge_of_small_views_keeps_everything() {
        let config = PeerSamplingConfig::default();
        let merged = merge_views(&View::new(), &view_of([(1, 0), (2, 0)]), &config);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn buffer_starts_with_self_and_skips_recipient() {
        let config = PeerSamplingConfig::default();
        let local = PeerAddr::new("127.0.0.1", 5000);
        let recipient = PeerAddr::new("127.0.0.1", 3);
        let view = view_of((1..=9).map(|p| (p, p as u32)));

        for _ in 0..20 {
            let buffer = construct_buffer(&view, &local, &recipient, &config);
            assert_eq!(buffer.get(0), Some(&PeerDescriptor::fresh(&local)));
            assert_eq!(buffer.len(), 1 + config.max_view_size / 2 - 1);
            assert!(!buffer.contains(&recipient));
        }
    }

    #[test]
    fn buffer_of_empty_view_is_self_only() {
        let config = PeerSamplingConfig::default();
        let local = PeerAddr::new("127.0.0.1", 5000);
        let buffer = construct_buffer(&View::new(), &local, &local, &config);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn select_peer_picks_oldest_when_forced() {
        let config = PeerSamplingConfig {
            p_select_oldest: 1.0,
            ..Default::default()
        };
        let view = view_of([(1, 2), (2, 9), (3, 9)]);
        assert_eq!(select_peer(&view, &config).map(|d| d.port), Some(2));
        assert!(select_peer(&View::new(), &config).is_none());
    }

    #[test]
    fn select_peer_falls_back_when_all_fresh() {
        let config = PeerSamplingConfig {
            p_select_oldest: 1.0,
            ..Default::default()
        };
        let view = view_of([(1, 0), (2, 0)]);
        let picked = select_peer(&view, &config).unwrap();
        assert!(picked.port == 1 || picked.port == 2);
    }

    #[test]
    fn own_descriptor_is_stripped() {
        let local = PeerAddr::new("127.0.0.1", 1);
        let stripped = without_self(view_of([(1, 0), (2, 0)]), &local);
        assert_eq!(stripped, view_of([(2, 0)]));
    }
}
