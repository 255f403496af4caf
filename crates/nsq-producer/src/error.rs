use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no nsqd endpoints configured")]
    NoEndpoints,
}

/// Outcome of one publish, delivered synchronously (when no connection is
/// open) or via the callback passed to `pub_`/`mpub`/`dpub`.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no open connection to an nsqd")]
    NotConnected,

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("server rejected the command: {0}")]
    Server(nsq_protocol::ServerErrorKind),

    #[error(transparent)]
    Protocol(#[from] nsq_protocol::ProtocolError),
}
