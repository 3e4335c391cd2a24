/**
 * session/protocol.rs
 *
 * Messages between a host and its clients
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bumped whenever the peer messages change shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Player id; the host is always player 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

pub const HOST_PEER_ID: PeerId = PeerId(1);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A player in the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// First message from a client
    Hello { nickname: String, version: u32 },
    Welcome {
        player_id: PeerId,
        game: String,
        players: Vec<Peer>,
    },
    Rejected { reason: String },
    PlayerList { players: Vec<Peer> },
    GameChanged { game: String },
}

impl PeerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Welcome { .. } => "welcome",
            PeerMessage::Rejected { .. } => "rejected",
            PeerMessage::PlayerList { .. } => "player_list",
            PeerMessage::GameChanged { .. } => "game_changed",
        }
    }
}
