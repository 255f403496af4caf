//! High-level consumer: connects to static `nsqd` endpoints and/or polls
//! `nsqd_lookupd` for producers of a topic, maintains the connection set,
//! apportions RDY credit across it, and dispatches delivered messages to a
//! [`MessageHandler`].
//!
//! Grounded on pynsq's `nsq/reader.py` (`Reader` class) for the RDY
//! apportionment and backoff state machine, with a mio-driven event loop
//! and periodic `Repeater`-timed housekeeping for the coordinator itself.

mod config;
mod discovery;
mod error;
mod handler;
mod reader;

pub use config::ConsumerConfig;
pub use error::ConfigError;
pub use handler::MessageHandler;
pub use reader::Reader;
