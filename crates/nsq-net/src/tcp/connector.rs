use std::{collections::HashMap, io, net::SocketAddr, time::Duration as StdDuration};

use mio::{Events, Poll, Token};
use tracing::{debug, warn};

use super::stream::{set_socket_buf_size, ConnState, TcpStream};

/// Outcome of one `poll_with` tick, fed back to the caller so it can react
/// per-connection (NSQ's reconnect timing, RDY bookkeeping, etc. all live
/// above this crate).
pub enum PollEvent<'a> {
    Frame { token: Token, frame: &'a [u8] },
    Disconnected { token: Token },
}

/// Outbound-only connection multiplexer: many `mio`-backed TCP sockets
/// behind one `Poll`. This one never listens and never auto-reconnects —
/// the consumer/producer own reconnect timing themselves (discovery
/// polling re-resolves dynamic endpoints; static endpoints get a fixed
/// retry delay), so the connector stays a dumb multiplexer.
pub struct TcpConnector {
    poll: Poll,
    events: Events,
    conns: HashMap<Token, TcpStream>,
    next_token: usize,
    socket_buf_size: Option<usize>,
}

impl TcpConnector {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            conns: HashMap::new(),
            next_token: 0,
            socket_buf_size: None,
        })
    }

    /// Overrides the kernel SO_SNDBUF/SO_RCVBUF set on every socket this
    /// connector opens from this point on.
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    /// Opens a non-blocking outbound connection, registers it for
    /// read/write readiness, and returns the `Token` used to address it in
    /// subsequent calls.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let raw = mio::net::TcpStream::connect(addr)?;
        if let Some(size) = self.socket_buf_size {
            set_socket_buf_size(&raw, size);
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        let mut stream = TcpStream::new(raw, addr, token);
        stream.register(self.poll.registry())?;
        self.conns.insert(token, stream);
        debug!(%addr, ?token, "tcp: connected");
        Ok(token)
    }

    pub fn stream_mut(&mut self, token: Token) -> Option<&mut TcpStream> {
        self.conns.get_mut(&token)
    }

    pub fn is_connected(&self, token: Token) -> bool {
        self.conns.contains_key(&token)
    }

    /// Writes `bytes` to the connection addressed by `token`, enqueueing
    /// any part that would block. A missing token is a caller bug — the
    /// connection must have been closed already — and is logged, not
    /// panicked on.
    pub fn write_or_enqueue(&mut self, token: Token, bytes: &[u8]) -> ConnState {
        match self.conns.get_mut(&token) {
            Some(stream) => stream.write_or_enqueue(bytes),
            None => {
                warn!(?token, "tcp: write to unknown connection");
                ConnState::Disconnected
            }
        }
    }

    /// Deregisters and shuts down a connection, removing it from the
    /// connector entirely. Idempotent.
    pub fn close(&mut self, token: Token) {
        if let Some(mut stream) = self.conns.remove(&token) {
            stream.close(self.poll.registry());
        }
    }

    /// Blocks for up to `timeout`, then dispatches every ready connection's
    /// frames/disconnects through `on_event`.
    ///
    /// Connections that disconnect mid-tick are removed from the connector
    /// before this call returns; callers do not need to call `close`
    /// themselves in response to a `Disconnected` event.
    pub fn poll_with<F>(&mut self, timeout: Option<StdDuration>, mut on_event: F) -> io::Result<()>
    where
        F: FnMut(PollEvent<'_>),
    {
        self.poll.poll(&mut self.events, timeout)?;

        let mut disconnected = Vec::new();

        for event in &self.events {
            let token = event.token();
            let Some(stream) = self.conns.get_mut(&token) else {
                continue;
            };

            let mut frames = Vec::new();
            let state = stream.poll_with(event.is_readable(), event.is_writable(), |frame| {
                frames.push(frame.to_vec());
            });

            for frame in &frames {
                on_event(PollEvent::Frame { token, frame });
            }

            if state == ConnState::Disconnected {
                disconnected.push(token);
            }
        }

        for token in disconnected {
            self.close(token);
            on_event(PollEvent::Disconnected { token });
        }

        Ok(())
    }
}
