/**
 * traversal/mod.rs
 *
 * Traversal rendezvous:
 * - host code registration for hosts behind NAT
 * - host code resolution for clients
 * - registration keep-alive
 * - a traversal server to run the other side
 */

mod client;
mod protocol;
mod server;
mod types;

pub use client::{TraversalClient, TraversalLease, TraversalRendezvous};
pub use protocol::TraversalMessage;
pub use server::{TraversalServer, TraversalServerConfig, TraversalServerHandle};
pub use types::TraversalSession;
