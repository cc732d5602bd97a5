//! # Wire Protocol Messages
//!
//! Every protocol in this crate speaks JSON text over TCP. Frames are
//! separated by a single `0x04` control byte, which JSON encoders always
//! escape inside strings, so a frame never contains its own delimiter.
//!
//! ## Protocol Types
//!
//! | Protocol | Framing | Message Type |
//! |----------|---------|--------------|
//! | Peer sampling | [`Envelope`] (`PSS_REQ` / `PSS_RES`) | [`GossipPayload`] |
//! | Mesh broadcast | [`Envelope`] (`PBCAST`) | [`MeshMessage`] |
//! | Relay | bare frame | [`RelayMessage`] |
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: frames larger than 1 MiB close the connection.
//! - Decoding of clocks and hash parameters validates shapes before use.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::entries_hash::EntriesHash;
use crate::identity::PeerAddr;
use crate::qvc::QuasiVectorClock;
use crate::view::View;

/// Frame separator on every byte stream.
pub const MSG_DELIMITER: u8 = 0x04;

/// Maximum size of one frame, delimiter excluded (1 MiB).
/// SECURITY: Bounds the read buffer of every connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Header of a peer sampling request.
pub const PSS_REQ: &str = "PSS_REQ";

/// Header of a peer sampling response.
pub const PSS_RES: &str = "PSS_RES";

/// Header carrying every [`MeshMessage`].
pub const PBCAST: &str = "PBCAST";

// ============================================================================
// Framing
// ============================================================================

/// Serializes `value` and appends the delimiter.
pub fn encode_frame<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(MSG_DELIMITER);
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(frame)
}

/// Reads the next frame without its delimiter.
///
/// Returns `Ok(None)` at end of stream, including a partial frame cut off by
/// the peer closing. A frame exceeding [`MAX_FRAME_SIZE`] is an
/// `InvalidData` error; callers drop the connection.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let limit = MAX_FRAME_SIZE as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(MSG_DELIMITER, &mut frame)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if frame.last() != Some(&MSG_DELIMITER) {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", MAX_FRAME_SIZE),
            ));
        }
        return Ok(None);
    }
    frame.pop();
    Ok(Some(frame))
}

// ============================================================================
// Envelope
// ============================================================================

/// Addressed frame used between peers. `host`/`port` name the sender's
/// listening address, not the ephemeral address of the connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: String,
    pub data: Value,
    pub host: String,
    pub port: u16,
}

impl Envelope {
    pub fn sender(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }
}

// ============================================================================
// Peer Sampling
// ============================================================================

/// Body of `PSS_REQ` and `PSS_RES`; the first descriptor is the sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipPayload {
    pub view: View,
}

// ============================================================================
// Causal Broadcast
// ============================================================================

/// An application payload stamped with the sender's clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CausalMessage {
    pub qvc: QuasiVectorClock,
    pub msg: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub ids: Vec<PeerAddr>,
    pub entries_hash: EntriesHash,
}

/// Messages of the decentralized group protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshMessage {
    JoinReq,
    JoinResp(JoinResponse),
    Msg(CausalMessage),
    Joined,
    Quit,
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownUser {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayJoinRequest {
    pub user_name: String,
    pub document_title: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayJoinResponse {
    pub id: String,
    pub name: String,
    pub known_users: Vec<KnownUser>,
    /// Clock width of the document (the hash modulus).
    pub r: u64,
    pub entries: Vec<usize>,
    pub document_title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeft {
    pub id: String,
}

/// Messages between a relay hub and its clients. `Msg` bodies are relayed
/// verbatim; clients decode them as [`CausalMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    JoinReq(RelayJoinRequest),
    JoinResp(RelayJoinResponse),
    Msg(Value),
    UserConnected(KnownUser),
    UserDisconnected(UserLeft),
}
