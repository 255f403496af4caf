//! Single-connection NSQ session logic shared by the consumer and producer:
//! handshake/feature-negotiation state machine, RDY/in-flight bookkeeping
//! per connection, the backoff timer, and message response lifecycle.
//!
//! Grounded on `nsqio/pynsq`'s negotiation sequence (`nsq/async.py`'s
//! `AsyncConn`). Connections emit a small tagged `Event` enum, to avoid
//! string-keyed listener dispatch, that the owning Consumer or Producer
//! subscribes to.

mod backoff;
mod connection;
mod message;

pub use backoff::{BackoffConfig, BackoffTimer};
pub use connection::{Connection, ConnState, ConnectionConfig, Event};
pub use message::{Message, MessageId, MessageResponder};
