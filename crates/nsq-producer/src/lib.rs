//! A small producer: a pool of connections to a fixed set of `nsqd`s, with
//! per-connection FIFO callback queues for PUB/MPUB/DPUB responses.
//!
//! Grounded on pynsq's `nsq/writer.py` (`Writer` class) for the
//! random-connection-selection and close/reconnect behavior, sharing the
//! same mio event-loop style as `nsq-consumer`.

mod config;
mod error;
mod writer;

pub use config::ProducerConfig;
pub use error::{ConfigError, PublishError};
pub use writer::Writer;
