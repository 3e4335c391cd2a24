#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod error;
pub mod factory;
pub mod ffi;
pub mod params;
mod port_mapping;
pub mod session;
pub mod setup;
pub mod transport;
pub mod traversal;
pub mod ui;

pub use config::{ConfigStore, MemoryConfig, NetPlaySettings};
pub use error::{Result, SessionError, TraversalError};
pub use factory::{PendingSession, SessionFactory, SessionOptions};
pub use params::{ConnectPlan, ConnectionParameters, HostCode, Mode, Role, TraversalServerAddr};
pub use session::{SessionEndpoint, SessionState};
pub use setup::NetPlaySetup;
pub use traversal::TraversalRendezvous;
pub use ui::NetPlayUi;
