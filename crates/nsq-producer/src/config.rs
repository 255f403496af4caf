use std::net::SocketAddr;

use nsq_core::ConnectionConfig;
use nsq_timing::Duration;

/// A producer only ever talks to a fixed set of `nsqd`s — there is no
/// lookupd discovery on the write side (a writer has to know exactly which
/// nodes it is allowed to publish to).
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub nsqd_endpoints: Vec<SocketAddr>,
    /// How long to wait before retrying a static endpoint after its
    /// connection closes.
    pub reconnect_interval: Duration,
    pub connection: ConnectionConfig,
}

impl ProducerConfig {
    pub fn new(nsqd_endpoints: Vec<SocketAddr>) -> Self {
        Self {
            nsqd_endpoints,
            reconnect_interval: Duration::from_secs(15),
            connection: ConnectionConfig {
                client_id: String::new(),
                hostname: String::new(),
                user_agent: concat!("nsq-producer/", env!("CARGO_PKG_VERSION")).to_owned(),
                heartbeat_interval: Duration::from_secs(30),
                output_buffer_size: 16 * 1024,
                output_buffer_timeout: Duration::from_millis(250),
                sample_rate: 0,
                msg_timeout: Duration::from_secs(60),
                auth_secret: None,
                requeue_delay_base: 90,
            },
        }
    }
}
