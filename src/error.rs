use std::time::Duration;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Everything that can go wrong while supervising a game instance.
///
/// All variants are fatal for the environment that produced them; the caller
/// is expected to close the harness instead of stepping it further.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("port {port} is held by {holder}")]
    PortConflict { port: u16, holder: String },

    #[error("failed to connect to game instance at {host}:{port} within {attempts} attempts")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("action space size in configuration ({expected}) does not match game client ({actual})")]
    ConfigMismatch { expected: usize, actual: usize },

    #[error("game process {pid} did not exit within {timeout:?}")]
    ShutdownTimeout { pid: u32, timeout: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        HarnessError::Protocol(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        HarnessError::Config(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        HarnessError::InvalidState(msg.into())
    }
}
