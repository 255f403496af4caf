//! Non-blocking TCP substrate for the nsq client crates.
//!
//! A `mio`-backed connector multiplexing many sockets behind one `Poll`,
//! and a per-connection framer that turns a byte stream into
//! length-prefixed frames. This crate knows nothing about NSQ's
//! command/frame semantics — it only knows "4-byte big-endian length,
//! then that many bytes" and hands the raw frame up to
//! `nsq-protocol`/`nsq-core` to interpret.
//!
//! Reconnection is deliberately *not* handled here. The consumer owns
//! reconnect timing explicitly — discovery polling for dynamic endpoints,
//! a fixed 15s delay for static ones — so this crate stays a dumb
//! connection multiplexer and the caller decides when to call `connect`
//! again.

pub mod tcp;

pub use tcp::{ConnState, PollEvent, StreamTransform, TcpConnector, TcpStream};
