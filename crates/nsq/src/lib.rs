//! NSQ client library.
//!
//! Umbrella crate re-exporting the workspace's individual pieces under
//! short names, and the most commonly reached-for types directly so a
//! caller who just wants a consumer or a producer doesn't need to depend on
//! the sub-crates by hand.

pub use nsq_consumer as consumer;
pub use nsq_core as core;
pub use nsq_net as net;
pub use nsq_producer as producer;
pub use nsq_protocol as protocol;
pub use nsq_timing as timing;
pub use nsq_utils as utils;
pub use tracing;

pub use nsq_consumer::{ConfigError as ConsumerConfigError, ConsumerConfig, MessageHandler, Reader};
pub use nsq_core::Message;
pub use nsq_producer::{ConfigError as ProducerConfigError, ProducerConfig, PublishError, Writer};
