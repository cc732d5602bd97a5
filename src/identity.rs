//! # Peer Addressing and Identifier Sources
//!
//! Peers in the decentralized mode are identified by the address they listen
//! on. A [`PeerAddr`] is the `(host, port)` pair carried in every envelope,
//! every gossip descriptor and every mesh membership list.
//!
//! The relay hub instead assigns opaque string identifiers to its users. Those
//! come from an injectable [`IdSource`] so that tests and embedders can choose
//! between time-ordered identifiers ([`MonotonicIds`]) and random ones
//! ([`RandomIds`]) without any process-wide counter.
//!
//! ## Address Rules
//!
//! | Field | Accepted |
//! |-------|----------|
//! | host  | dotted IPv4 literal or `localhost` |
//! | port  | `1..=65534` |

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Highest port number accepted for listening or joining.
pub const MAX_PORT: u16 = 65534;

/// Milliseconds between the Unix epoch and 2010-01-01T00:00:00Z.
pub const ID_EPOCH_MILLIS: u64 = 1_262_304_000_000;

/// Identifiers available per millisecond before [`MonotonicIds`] borrows from
/// the next one.
pub const IDS_PER_MILLI: u64 = 4096;

/// Length in bytes of a [`RandomIds`] identifier before hex encoding.
pub const RANDOM_ID_LEN: usize = 16;

// ============================================================================
// Address Errors
// ============================================================================

/// Reasons an address string is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// The `host:port` separator is missing.
    MissingPort,
    /// Host is neither `localhost` nor a dotted IPv4 literal.
    InvalidHost(String),
    /// Port is not a number in `1..=65534`.
    InvalidPort(String),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort => write!(f, "address must have the form HOST:PORT"),
            Self::InvalidHost(h) => write!(f, "wrong IP address: {h}"),
            Self::InvalidPort(p) => write!(f, "wrong port number: {p}"),
        }
    }
}

impl std::error::Error for AddrError {}

/// Returns true for `localhost` (any case) and dotted IPv4 literals.
pub fn check_address(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.parse::<Ipv4Addr>().is_ok()
}

/// Parses a port number, rejecting 0 and 65535.
pub fn parse_port(port: &str) -> Result<u16, AddrError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 && p <= MAX_PORT => Ok(p),
        _ => Err(AddrError::InvalidPort(port.to_string())),
    }
}

// ============================================================================
// PeerAddr
// ============================================================================

/// Listening address of a peer; the only identity a peer has in mesh mode.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Builds an address after checking both parts.
    pub fn checked(host: &str, port: &str) -> Result<Self, AddrError> {
        if !check_address(host) {
            return Err(AddrError::InvalidHost(host.to_string()));
        }
        let port = parse_port(port)?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddrError::MissingPort)?;
        Self::checked(host, port)
    }
}

// ============================================================================
// Identifier Sources
// ============================================================================

/// Supplier of unique user identifiers for the relay hub.
pub trait IdSource: Send + 'static {
    fn next_id(&mut self) -> String;
}

/// Time-ordered identifiers: milliseconds since 2010 times 4096 plus a
/// per-millisecond counter.
///
/// Values are strictly increasing for the lifetime of the instance, even if
/// more than 4096 identifiers are issued in one millisecond or the wall clock
/// steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicIds {
    last: u64,
}

impl MonotonicIds {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(ID_EPOCH_MILLIS)
            .saturating_sub(ID_EPOCH_MILLIS)
    }

    fn next_value(&mut self, millis: u64) -> u64 {
        let candidate = millis.saturating_mul(IDS_PER_MILLI);
        self.last = candidate.max(self.last + 1);
        self.last
    }
}

impl IdSource for MonotonicIds {
    fn next_id(&mut self) -> String {
        self.next_value(Self::now_millis()).to_string()
    }
}

/// Random 128-bit identifiers, hex encoded.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&mut self) -> String {
        let mut bytes = [0u8; RANDOM_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}
