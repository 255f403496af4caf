use thiserror::Error;

/// Failures in encoding a command or decoding a frame off the wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid topic name {0:?}")]
    InvalidTopicName(String),

    #[error("invalid channel name {0:?}")]
    InvalidChannelName(String),

    #[error("frame too short: got {got} bytes, need at least {need}")]
    FrameTooShort { got: usize, need: usize },

    #[error("unknown frame type {0}")]
    UnknownFrameType(i32),

    #[error("malformed IDENTIFY payload")]
    Identify(#[from] serde_json::Error),

    #[error("server error: {0}")]
    ServerError(ServerErrorKind),
}

/// The ASCII token NSQ sends in an `ERROR` frame body (`E_INVALID`,
/// `E_FIN_FAILED`, ...), kept opaque rather than enumerated exhaustively
/// since nsqd adds new ones over time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorKind(pub String);

impl std::fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ServerErrorKind {
    pub fn from_body(body: &[u8]) -> Self {
        Self(String::from_utf8_lossy(body).into_owned())
    }

    /// `E_BAD_TOPIC`/`E_BAD_CHANNEL`/`E_INVALID`/`E_AUTH` close the
    /// connection per the protocol; everything else (e.g.
    /// `E_FIN_FAILED`, `E_REQ_FAILED`) is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.0.split_whitespace().next(),
            Some("E_BAD_TOPIC" | "E_BAD_CHANNEL" | "E_INVALID" | "E_AUTH")
        )
    }
}
