/**
 * traversal/types.rs
 *
 * Record of one rendezvous attempt
 */

use crate::params::{HostCode, TraversalServerAddr};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One in-flight or completed rendezvous
#[derive(Debug, Clone)]
pub struct TraversalSession {
    pub server: TraversalServerAddr,
    /// Code issued to us while hosting
    pub local_host_code: Option<HostCode>,
    /// Code we are looking up while joining
    pub target_host_code: Option<HostCode>,
    pub resolved_endpoint: Option<SocketAddr>,
    /// Last message seen from the server
    pub last_contact: Instant,
}

impl TraversalSession {
    pub fn new(server: TraversalServerAddr) -> Self {
        Self {
            server,
            local_host_code: None,
            target_host_code: None,
            resolved_endpoint: None,
            last_contact: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_contact = Instant::now();
    }

    pub fn since_last_contact(&self) -> Duration {
        self.last_contact.elapsed()
    }
}
