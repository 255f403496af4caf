use std::net::SocketAddr;

use nsq_core::ConnectionConfig;
use nsq_timing::Duration;

/// Every consumer construction parameter as a field on a plain record — no
/// runtime injection of unrecognized keys.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub topic: String,
    pub channel: String,

    /// Static producer addresses, connected directly with no discovery.
    pub nsqd_endpoints: Vec<SocketAddr>,
    /// Lookupd HTTP bases (e.g. `"http://127.0.0.1:4161"`), polled on a
    /// rotating schedule to discover producers dynamically.
    pub lookupd_endpoints: Vec<String>,

    /// `0` disables the tries limit.
    pub max_tries: u32,
    pub max_in_flight: u32,
    pub lookupd_poll_interval: Duration,
    /// Fraction of `lookupd_poll_interval`, applied as initial jitter so a
    /// fleet of consumers doesn't all poll lookupd in lockstep.
    pub lookupd_poll_jitter: f64,
    pub low_rdy_idle_timeout: Duration,
    pub max_backoff_duration: Duration,

    pub connection: ConnectionConfig,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            nsqd_endpoints: Vec::new(),
            lookupd_endpoints: Vec::new(),
            max_tries: 5,
            max_in_flight: 1,
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            low_rdy_idle_timeout: Duration::from_secs(10),
            max_backoff_duration: Duration::from_secs(128),
            connection: ConnectionConfig {
                client_id: String::new(),
                hostname: String::new(),
                user_agent: concat!("nsq-consumer/", env!("CARGO_PKG_VERSION")).to_owned(),
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
