use thiserror::Error;

/// Construction-time failures, reported synchronously from `Reader::new`
/// rather than surfacing asynchronously once the event loop is running:
/// fatal misconfiguration should fail the caller immediately, not after
/// the first poll tick.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid name: {0}")]
    InvalidName(#[from] nsq_protocol::ProtocolError),

    #[error("no nsqd or lookupd endpoints configured")]
    NoEndpoints,
}
