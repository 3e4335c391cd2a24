/**
 * config.rs
 *
 * NetPlay settings section: keys, defaults, typed view and store access
 */

use crate::error::Result;
use crate::params::{parse_port, ConnectionParameters, Mode, TraversalServerAddr};
use std::collections::HashMap;
use std::env;
use tracing::debug;

/// Section all keys live under
pub const SECTION: &str = "NetPlay";

pub const DEFAULT_TRAVERSAL_SERVER: &str = "stun.dolphin-emu.org";
pub const DEFAULT_TRAVERSAL_PORT: u16 = 6262;

/// Key names inside the section
pub mod keys {
    pub const NICKNAME: &str = "Nickname";
    pub const TRAVERSAL_CHOICE: &str = "TraversalChoice";
    pub const ADDRESS: &str = "Address";
    pub const HOST_CODE: &str = "HostCode";
    pub const CONNECT_PORT: &str = "ConnectPort";
    pub const HOST_PORT: &str = "HostPort";
    pub const LISTEN_PORT: &str = "ListenPort";
    pub const TRAVERSAL_SERVER: &str = "TraversalServer";
    pub const TRAVERSAL_PORT: &str = "TraversalPort";
    pub const SELECTED_HOST_GAME: &str = "SelectedHostGame";

    pub const ALL: [&str; 10] = [
        NICKNAME,
        TRAVERSAL_CHOICE,
        ADDRESS,
        HOST_CODE,
        CONNECT_PORT,
        HOST_PORT,
        LISTEN_PORT,
        TRAVERSAL_SERVER,
        TRAVERSAL_PORT,
        SELECTED_HOST_GAME,
    ];
}

/// Key/value access to the NetPlay section
pub trait ConfigStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: &str);

    /// Apply every entry as a single update: either all land or none do.
    fn set_all(&mut self, entries: &[(&str, &str)]);
}

/// In-process store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryConfig {
    values: HashMap<String, String>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `NETPLAY_<KEY>` environment variables, e.g. `NETPLAY_TRAVERSAL_SERVER`
    pub fn with_env_overrides(mut self) -> Self {
        for key in keys::ALL {
            if let Ok(value) = env::var(env_var_name(key)) {
                debug!(key, "config value taken from environment");
                self.values.insert(key.to_string(), value);
            }
        }
        self
    }
}

impl ConfigStore for MemoryConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn set_all(&mut self, entries: &[(&str, &str)]) {
        self.values.extend(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
    }
}

/// `TraversalServer` -> `NETPLAY_TRAVERSAL_SERVER`
pub fn env_var_name(key: &str) -> String {
    let mut name = String::from("NETPLAY");
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() || i == 0 {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

fn get_trimmed(store: &impl ConfigStore, key: &str, default: &str) -> String {
    store
        .get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

/// Spaces are removed anywhere in the value; empty falls back to the default
fn get_compact(store: &impl ConfigStore, key: &str, default: &str) -> String {
    let value: String = get_trimmed(store, key, default)
        .chars()
        .filter(|c| *c != ' ')
        .collect();
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

pub fn traversal_server(store: &impl ConfigStore) -> String {
    get_compact(store, keys::TRAVERSAL_SERVER, DEFAULT_TRAVERSAL_SERVER)
}

pub fn traversal_port(store: &impl ConfigStore) -> String {
    get_compact(store, keys::TRAVERSAL_PORT, &DEFAULT_TRAVERSAL_PORT.to_string())
}

/// Restore the default traversal server and port together
pub fn reset_traversal(store: &mut impl ConfigStore) {
    let port = DEFAULT_TRAVERSAL_PORT.to_string();
    store.set_all(&[
        (keys::TRAVERSAL_SERVER, DEFAULT_TRAVERSAL_SERVER),
        (keys::TRAVERSAL_PORT, port.as_str()),
    ]);
}

/// Typed view of the NetPlay section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetPlaySettings {
    pub nickname: String,
    pub mode: Mode,
    pub address: String,
    pub host_code: String,
    pub connect_port: String,
    pub host_port: String,
    /// Forced traversal listen port, "0" when not forced
    pub listen_port: String,
    pub traversal_server: String,
    pub traversal_port: String,
    pub selected_host_game: String,
}

impl Default for NetPlaySettings {
    fn default() -> Self {
        Self::load(&MemoryConfig::new())
    }
}

impl NetPlaySettings {
    pub fn load(store: &impl ConfigStore) -> Self {
        Self {
            nickname: get_trimmed(store, keys::NICKNAME, "Player"),
            mode: Mode::from_choice(&get_trimmed(store, keys::TRAVERSAL_CHOICE, "direct")),
            address: get_trimmed(store, keys::ADDRESS, "127.0.0.1"),
            host_code: get_trimmed(store, keys::HOST_CODE, "00000000"),
            connect_port: get_trimmed(store, keys::CONNECT_PORT, "2626"),
            host_port: get_trimmed(store, keys::HOST_PORT, "2626"),
            listen_port: get_trimmed(store, keys::LISTEN_PORT, "0"),
            traversal_server: traversal_server(store),
            traversal_port: traversal_port(store),
            selected_host_game: get_trimmed(store, keys::SELECTED_HOST_GAME, ""),
        }
    }

    /// Persist the user-editable fields.
    ///
    /// Only the field shown for the current mode is written: `Address` in
    /// direct mode, `HostCode` in traversal mode. Traversal server and
    /// selected game have their own write paths.
    pub fn save(&self, store: &mut impl ConfigStore) {
        let target = match self.mode {
            Mode::Direct => (keys::ADDRESS, self.address.as_str()),
            Mode::Traversal => (keys::HOST_CODE, self.host_code.as_str()),
        };
        store.set_all(&[
            (keys::TRAVERSAL_CHOICE, self.mode.as_choice()),
            (keys::NICKNAME, self.nickname.as_str()),
            target,
            (keys::CONNECT_PORT, self.connect_port.as_str()),
            (keys::HOST_PORT, self.host_port.as_str()),
            (keys::LISTEN_PORT, self.listen_port.as_str()),
        ]);
    }

    pub fn traversal_server_addr(&self) -> Result<TraversalServerAddr> {
        Ok(TraversalServerAddr {
            host: self.traversal_server.clone(),
            port: parse_port("TraversalPort", &self.traversal_port)?,
        })
    }

    /// True when a traversal host asked for a specific, well-formed listen port
    pub fn forces_listen_port(&self) -> bool {
        self.mode == Mode::Traversal
            && matches!(parse_port("ListenPort", &self.listen_port), Ok(port) if port != 0)
    }

    /// Parameters for the connect action.
    ///
    /// Only the fields the current mode shows are parsed.
    pub fn client_parameters(&self) -> Result<ConnectionParameters> {
        let params = match self.mode {
            Mode::Direct => ConnectionParameters::join_direct(
                &self.nickname,
                &self.address,
                parse_port("ConnectPort", &self.connect_port)?,
            ),
            Mode::Traversal => ConnectionParameters::join_traversal(
                &self.nickname,
                &self.host_code,
                &self.traversal_server_addr()?,
            ),
        };
        Ok(params)
    }

    /// Parameters for the host action
    pub fn host_parameters(&self) -> Result<ConnectionParameters> {
        let params = match self.mode {
            Mode::Direct => ConnectionParameters::host_direct(
                &self.nickname,
                parse_port("HostPort", &self.host_port)?,
            ),
            Mode::Traversal => ConnectionParameters::host_traversal(
                &self.nickname,
                parse_port("ListenPort", &self.listen_port)?,
                &self.traversal_server_addr()?,
            ),
        };
        Ok(params)
    }
}
