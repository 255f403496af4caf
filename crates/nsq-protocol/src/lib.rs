//! NSQ wire protocol: command encoding and frame decoding.
//!
//! Grounded on the real `nsqio/pynsq` wire layer (`nsq/nsq.py`,
//! `nsq/protocol.py`): 4-byte big-endian lengths throughout, a `"  V2"`
//! magic handshake, ASCII commands with an optional length-prefixed body,
//! and three frame types (response, error, message). Name validation is a
//! hand-rolled character scan rather than a regex, keeping the dependency
//! graph free of a regex engine.

mod command;
mod error;
mod frame;
mod name;

pub use command::Command;
pub use error::{ProtocolError, ServerErrorKind};
pub use frame::{decode_frame, is_heartbeat, is_ok_response, Frame, RawMessage, MAGIC_V2};
pub use name::{valid_channel_name, valid_topic_name};
