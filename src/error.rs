//! Wireflow Error Types

use thiserror::Error;

use crate::peer::PeerId;

/// Result type alias for Wireflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// UAPI errno for a malformed control-socket operation
pub const IPC_ERROR_INVALID: i64 = -22;

/// UAPI errno for a failed `set` operation
pub const IPC_ERROR_INVALID_KEY: i64 = -2;

/// UAPI errno for anything not otherwise classified
pub const IPC_ERROR_UNKNOWN: i64 = -55;

/// Relay wire-frame errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error("invalid magic: 0x{0:08x}")]
    InvalidMagic(u32),

    #[error("unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Wireflow error types
#[derive(Error, Debug)]
pub enum Error {
    // Registry errors
    #[error("agent not found for peer {0}")]
    AgentNotFound(PeerId),

    #[error("peer already exists: {0}")]
    PeerExists(PeerId),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    // Connection establishment errors
    #[error("probe connect failed for peer {peer} after {attempts} attempts, need check the network you are in")]
    ProbeFailed { peer: PeerId, attempts: u32 },

    #[error("handshake with peer {0} timed out")]
    HandshakeTimeout(PeerId),

    #[error("{kind} dial failed: {reason}")]
    DialFailed { kind: String, reason: String },

    #[error("all dialers failed: {}", .0.join("; "))]
    AllDialersFailed(Vec<String>),

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("transport closed")]
    TransportClosed,

    // Wire errors
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("STUN error: {0}")]
    Stun(String),

    // Device errors
    #[error("IPC error {code}: {message}")]
    Ipc { code: i64, message: String },

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("management API error: {0}")]
    Management(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout(_)
                | Error::DialFailed { .. }
                | Error::AllDialersFailed(_)
                | Error::TransportClosed
                | Error::Io(_)
        )
    }

    /// UAPI errno reported for this error
    pub fn ipc_code(&self) -> i64 {
        match self {
            Error::Ipc { code, .. } => *code,
            Error::InvalidKey(_) => IPC_ERROR_INVALID_KEY,
            _ => IPC_ERROR_UNKNOWN,
        }
    }

    pub(crate) fn ipc_invalid(message: impl Into<String>) -> Self {
        Error::Ipc {
            code: IPC_ERROR_INVALID,
            message: message.into(),
        }
    }
}
