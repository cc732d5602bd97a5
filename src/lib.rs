//! # Floodit - Gossip Membership and Causal Broadcast
//!
//! Floodit lets a group of peers exchange messages that are delivered in
//! causal order with high probability, using constant-size clocks:
//!
//! - **Peer Sampling**: gossip-based membership where every peer keeps a
//!   small, continuously refreshed partial view of the overlay
//! - **Quasi-Vector Clocks**: fixed-width clocks where each peer owns `k`
//!   slots picked by a shared hash, so clock size does not grow with the
//!   group
//! - **Causal Broadcast**: delivery gated on clock readiness, with stale
//!   deliveries flagged rather than dropped
//! - **Topologies**: a decentralized full mesh or a central relay hub
//!
//! ## Architecture
//!
//! Stateful components follow the actor pattern:
//! - Each component has a public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: transport, peer sampling and a mesh group |
//! | `identity` | Peer addresses and user id sources |
//! | `messages` | Wire types and delimiter framing |
//! | `view` | Bounded partial views of the overlay |
//! | `peer_sampling` | Gossip exchange and view merging |
//! | `entries_hash` | Prime modulus and the id-to-slots hash |
//! | `qvc` | Quasi-vector clocks |
//! | `causal` | Causal delivery core |
//! | `pbcast` | Causal broadcast over any group transport |
//! | `mesh` | Full-mesh group transport |
//! | `relay` | Relay hub server and its group transport |
//! | `transport` | TCP transport |
//! | `protocols` | Transport trait definitions |

pub mod causal;
pub mod entries_hash;
pub mod identity;
pub mod mesh;
pub mod messages;
pub mod node;
pub mod pbcast;
pub mod peer_sampling;
pub mod protocols;
pub mod qvc;
pub mod relay;
pub mod transport;
pub mod view;

pub use causal::Delivery;
pub use entries_hash::{next_prime, EntriesHash, EntriesHashGenerator, HashParamsError};
pub use identity::{AddrError, IdSource, MonotonicIds, PeerAddr, RandomIds};
pub use mesh::{MeshGroup, MeshMode};
pub use node::{Node, NodeConfig};
pub use pbcast::{BroadcastConfig, BroadcastEvent, CausalBroadcast};
pub use peer_sampling::{PeerSampling, PeerSamplingConfig};
pub use protocols::{GroupEvent, GroupSession, GroupTransport, Member, Transport};
pub use qvc::{ClockError, QuasiVectorClock};
pub use relay::{HubConfig, RelayGroup, RelayHub};
pub use transport::TcpTransport;
pub use view::{PeerDescriptor, View};
