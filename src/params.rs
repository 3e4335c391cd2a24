/**
 * params.rs
 *
 * Connection parameters and their validation into a connect plan
 */

use crate::config::{DEFAULT_TRAVERSAL_PORT, DEFAULT_TRAVERSAL_SERVER};
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host codes are fixed width
pub const HOST_CODE_LEN: usize = 8;

/// Longest nickname accepted, in characters
pub const MAX_NICKNAME_LEN: usize = 32;

/// Which side of the session we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Client,
}

/// How the peers find each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Direct,
    Traversal,
}

impl Mode {
    /// Value stored under `TraversalChoice`
    pub fn as_choice(self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Traversal => "traversal",
        }
    }

    /// Anything other than "traversal" selects direct mode
    pub fn from_choice(choice: &str) -> Self {
        if choice.trim() == "traversal" {
            Mode::Traversal
        } else {
            Mode::Direct
        }
    }
}

/// Short shareable code identifying a hosted session on a traversal server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostCode(String);

impl HostCode {
    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.len() != HOST_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SessionError::invalid(format!(
                "host code must be {} alphanumeric characters, got {:?}",
                HOST_CODE_LEN, code
            )));
        }
        Ok(Self(code.to_string()))
    }

    /// Fresh random code as issued by the traversal server
    pub fn generate() -> Self {
        let bytes: [u8; HOST_CODE_LEN / 2] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HostCode {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<HostCode> for String {
    fn from(code: HostCode) -> Self {
        code.0
    }
}

/// Trimmed nickname, 1 to `MAX_NICKNAME_LEN` characters
pub fn validate_nickname(nickname: &str) -> Result<String> {
    let nickname = nickname.trim();
    if nickname.is_empty() {
        return Err(SessionError::invalid("nickname is empty"));
    }
    if nickname.chars().count() > MAX_NICKNAME_LEN {
        return Err(SessionError::invalid(format!(
            "nickname is longer than {} characters",
            MAX_NICKNAME_LEN
        )));
    }
    Ok(nickname.to_string())
}

/// Parse a port typed by the user.
///
/// Non-numeric or out-of-range input is rejected instead of defaulting to 0.
pub fn parse_port(field: &str, text: &str) -> Result<u16> {
    text.trim().parse::<u16>().map_err(|_| {
        SessionError::invalid(format!("{} must be a number in 0..=65535, got {:?}", field, text))
    })
}

/// Traversal server coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalServerAddr {
    pub host: String,
    pub port: u16,
}

impl Default for TraversalServerAddr {
    fn default() -> Self {
        Self {
            host: DEFAULT_TRAVERSAL_SERVER.to_string(),
            port: DEFAULT_TRAVERSAL_PORT,
        }
    }
}

impl fmt::Display for TraversalServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything the user supplied for one connect or host action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub role: Role,
    pub mode: Mode,
    pub nickname: String,
    /// Meaningful for direct clients only
    pub address: String,
    /// Meaningful for traversal clients only
    pub host_code: String,
    /// Meaningful in direct mode only
    pub port: u16,
    /// Traversal hosts only, 0 for an ephemeral port
    pub listen_port: u16,
    pub traversal_server_host: String,
    pub traversal_server_port: u16,
    /// Hosts only: game offered to the first players, may be empty
    pub game: String,
}

impl ConnectionParameters {
    fn base(role: Role, mode: Mode, nickname: &str) -> Self {
        let server = TraversalServerAddr::default();
        Self {
            role,
            mode,
            nickname: nickname.to_string(),
            address: String::new(),
            host_code: String::new(),
            port: 0,
            listen_port: 0,
            traversal_server_host: server.host,
            traversal_server_port: server.port,
            game: String::new(),
        }
    }

    /// Host with `game` already selected when the session is announced
    pub fn with_game(mut self, game: &str) -> Self {
        self.game = game.trim().to_string();
        self
    }

    pub fn host_direct(nickname: &str, port: u16) -> Self {
        Self {
            port,
            ..Self::base(Role::Host, Mode::Direct, nickname)
        }
    }

    pub fn host_traversal(nickname: &str, listen_port: u16, server: &TraversalServerAddr) -> Self {
        Self {
            listen_port,
            traversal_server_host: server.host.clone(),
            traversal_server_port: server.port,
            ..Self::base(Role::Host, Mode::Traversal, nickname)
        }
    }

    pub fn join_direct(nickname: &str, address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            ..Self::base(Role::Client, Mode::Direct, nickname)
        }
    }

    pub fn join_traversal(nickname: &str, host_code: &str, server: &TraversalServerAddr) -> Self {
        Self {
            host_code: host_code.to_string(),
            traversal_server_host: server.host.clone(),
            traversal_server_port: server.port,
            ..Self::base(Role::Client, Mode::Traversal, nickname)
        }
    }

    fn traversal_server(&self) -> Result<TraversalServerAddr> {
        let host = self.traversal_server_host.trim();
        if host.is_empty() {
            return Err(SessionError::invalid("traversal server host is empty"));
        }
        if self.traversal_server_port == 0 {
            return Err(SessionError::invalid("traversal server port must not be 0"));
        }
        Ok(TraversalServerAddr {
            host: host.to_string(),
            port: self.traversal_server_port,
        })
    }

    /// Check the fields relevant to (role, mode) and drop the rest
    pub fn validate(&self) -> Result<ValidatedParameters> {
        let nickname = validate_nickname(&self.nickname)?;

        let plan = match (self.role, self.mode) {
            (Role::Host, Mode::Direct) => ConnectPlan::HostDirect { port: self.port },
            (Role::Host, Mode::Traversal) => ConnectPlan::HostTraversal {
                listen_port: self.listen_port,
                server: self.traversal_server()?,
            },
            (Role::Client, Mode::Direct) => {
                let address = self.address.trim();
                if address.is_empty() {
                    return Err(SessionError::invalid("address is empty"));
                }
                if self.port == 0 {
                    return Err(SessionError::invalid("connect port must not be 0"));
                }
                ConnectPlan::JoinDirect {
                    address: address.to_string(),
                    port: self.port,
                }
            }
            (Role::Client, Mode::Traversal) => ConnectPlan::JoinTraversal {
                host_code: HostCode::parse(&self.host_code)?,
                server: self.traversal_server()?,
            },
        };

        Ok(ValidatedParameters { nickname, plan })
    }
}

/// One variant per (role, mode), carrying only the fields that matter there
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPlan {
    HostDirect { port: u16 },
    HostTraversal { listen_port: u16, server: TraversalServerAddr },
    JoinDirect { address: String, port: u16 },
    JoinTraversal { host_code: HostCode, server: TraversalServerAddr },
}

impl ConnectPlan {
    pub fn role(&self) -> Role {
        match self {
            ConnectPlan::HostDirect { .. } | ConnectPlan::HostTraversal { .. } => Role::Host,
            ConnectPlan::JoinDirect { .. } | ConnectPlan::JoinTraversal { .. } => Role::Client,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            ConnectPlan::HostDirect { .. } | ConnectPlan::JoinDirect { .. } => Mode::Direct,
            ConnectPlan::HostTraversal { .. } | ConnectPlan::JoinTraversal { .. } => {
                Mode::Traversal
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedParameters {
    pub nickname: String,
    pub plan: ConnectPlan,
}
