/**
 * traversal/protocol.rs
 *
 * Traversal server message types
 */

use crate::params::HostCode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Messages exchanged with the traversal server, as JSON text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraversalMessage {
    /// Host asks for a code bound to its listening port
    Register {
        listen_port: u16,
    },
    Registered {
        host_code: HostCode,
        public_addr: SocketAddr,
    },
    /// Kept as a raw string so unknown or malformed codes get a `not_found`
    Resolve {
        host_code: String,
    },
    Resolved {
        host_code: HostCode,
        addr: SocketAddr,
    },
    NotFound {
        host_code: String,
    },
    Keepalive,
    /// Sent to a host when a client resolved its code
    PeerIncoming {
        addr: SocketAddr,
    },
    Error {
        message: String,
    },
}

impl TraversalMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            TraversalMessage::Register { .. } => "register",
            TraversalMessage::Registered { .. } => "registered",
            TraversalMessage::Resolve { .. } => "resolve",
            TraversalMessage::Resolved { .. } => "resolved",
            TraversalMessage::NotFound { .. } => "not_found",
            TraversalMessage::Keepalive => "keepalive",
            TraversalMessage::PeerIncoming { .. } => "peer_incoming",
            TraversalMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_tagged_snake_case() {
        let register = TraversalMessage::Register { listen_port: 2626 };
        let json = serde_json::to_string(&register).unwrap();
        assert_eq!(json, r#"{"type":"register","listen_port":2626}"#);

        let json = serde_json::to_string(&TraversalMessage::Keepalive).unwrap();
        assert_eq!(json, r#"{"type":"keepalive"}"#);
    }

    #[test]
    fn registered_carries_a_valid_code() {
        let msg: TraversalMessage = serde_json::from_str(
            r#"{"type":"registered","host_code":"0badf00d","public_addr":"203.0.113.7:2626"}"#,
        )
        .unwrap();
        match msg {
            TraversalMessage::Registered { host_code, public_addr } => {
                assert_eq!(host_code.as_str(), "0badf00d");
                assert_eq!(public_addr.port(), 2626);
            }
            other => panic!("unexpected {other:?}"),
        }

        let bad = serde_json::from_str::<TraversalMessage>(
            r#"{"type":"registered","host_code":"nope","public_addr":"203.0.113.7:2626"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn message_type_matches_tag() {
        let msg = TraversalMessage::NotFound {
            host_code: "00000000".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.message_type());
    }
}
