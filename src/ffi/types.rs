/**
 * ffi/types.rs
 *
 * Common FFI types and structures
 */

use crate::session::SessionState;
use libc::c_char;

/// Opaque handle for a SessionEndpoint and the runtime driving it
#[repr(C)]
pub struct NetplaySessionHandle {
    _private: [u8; 0],
}

/// Session state (matches SessionState)
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetplayState {
    Idle = 0,
    Listening = 1,
    Bound = 2,
    Resolving = 3,
    Connecting = 4,
    Connected = 5,
    Closed = 6,
    Failed = 7,
}

impl From<SessionState> for NetplayState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Idle => NetplayState::Idle,
            SessionState::Listening => NetplayState::Listening,
            SessionState::Bound => NetplayState::Bound,
            SessionState::Resolving => NetplayState::Resolving,
            SessionState::Connecting => NetplayState::Connecting,
            SessionState::Connected => NetplayState::Connected,
            SessionState::Closed => NetplayState::Closed,
            SessionState::Failed => NetplayState::Failed,
        }
    }
}

impl From<NetplayState> for SessionState {
    fn from(state: NetplayState) -> Self {
        match state {
            NetplayState::Idle => SessionState::Idle,
            NetplayState::Listening => SessionState::Listening,
            NetplayState::Bound => SessionState::Bound,
            NetplayState::Resolving => SessionState::Resolving,
            NetplayState::Connecting => SessionState::Connecting,
            NetplayState::Connected => SessionState::Connected,
            NetplayState::Closed => SessionState::Closed,
            NetplayState::Failed => SessionState::Failed,
        }
    }
}

/// Parameters for `netplay_session_create`.
///
/// String fields may be null where the role and mode do not use them.
#[repr(C)]
pub struct NetplaySessionConfig {
    pub is_host: bool,
    pub use_traversal: bool,
    pub nickname: *const c_char,
    /// Direct clients
    pub address: *const c_char,
    /// Traversal clients
    pub host_code: *const c_char,
    /// Direct mode: connect port (client) or listen port (host)
    pub port: u16,
    /// Traversal hosts, 0 for an ephemeral port
    pub listen_port: u16,
    pub traversal_server_host: *const c_char,
    pub traversal_server_port: u16,
    /// 0 keeps the default
    pub connect_timeout_ms: u32,
    /// Hosts: game selected from the start, may be null
    pub game: *const c_char,
    /// Hosts: forward the listen port through UPnP
    pub upnp: bool,
}
