use std::collections::{HashMap, VecDeque};

use mio::Token;
use nsq_core::{ConnState, Connection, Event as ConnEvent};
use nsq_net::{PollEvent, TcpConnector};
use nsq_protocol::{decode_frame, Command, Frame};
use nsq_timing::Instant;
use rand::Rng;
use tracing::warn;

use crate::{
    config::ProducerConfig,
    error::{ConfigError, PublishError},
};

type Callback = Box<dyn FnOnce(Result<(), PublishError>)>;

/// A pool of connections to a fixed set of `nsqd`s. Each publish picks a
/// random connected member of the pool (matching `pynsq`'s `Writer`, which
/// round-robins/randomizes rather than sticking to one connection) and
/// queues its callback FIFO behind that connection's in-flight commands,
/// since nsqd answers PUB/MPUB/DPUB in the order it received them.
pub struct Writer {
    config: ProducerConfig,
    connector: TcpConnector,
    connections: HashMap<Token, Connection>,
    callbacks: HashMap<Token, VecDeque<Callback>>,
    reconnect_at: HashMap<(String, u16), Instant>,
    closed: bool,
}

impl Writer {
    pub fn new(config: ProducerConfig) -> Result<Self, ConfigError> {
        if config.nsqd_endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut writer = Self {
            connector: TcpConnector::new().map_err(|_| ConfigError::NoEndpoints)?,
            connections: HashMap::new(),
            callbacks: HashMap::new(),
            reconnect_at: HashMap::new(),
            closed: false,
            config: config.clone(),
        };

        for addr in config.nsqd_endpoints {
            writer.connect_to(addr);
        }

        Ok(writer)
    }

    fn connect_to(&mut self, addr: std::net::SocketAddr) {
        let token = match self.connector.connect(addr) {
            Ok(token) => token,
            Err(err) => {
                warn!(%addr, %err, "producer: failed to connect to nsqd");
                self.reconnect_at.insert(
                    (addr.ip().to_string(), addr.port()),
                    Instant::now() + self.config.reconnect_interval,
                );
                return;
            }
        };

        let conn = Connection::new(addr.ip().to_string(), addr.port(), token, self.config.connection.clone());
        conn.begin_connect();
        self.flush_outbox(token, &conn);
        self.connections.insert(token, conn);
        self.callbacks.insert(token, VecDeque::new());
    }

    /// Publishes a single message. `callback` is invoked exactly once, with
    /// the server's eventual response or with `PublishError::NotConnected`
    /// synchronously (before this call returns) if no connection is ready.
    pub fn pub_(
        &mut self,
        topic: &str,
        body: Vec<u8>,
        callback: impl FnOnce(Result<(), PublishError>) + 'static,
    ) {
        match Command::pub_(topic, body) {
            Ok(cmd) => self.send_command(cmd, callback),
            Err(err) => callback(Err(err.into())),
        }
    }

    pub fn mpub(
        &mut self,
        topic: &str,
        bodies: Vec<Vec<u8>>,
        callback: impl FnOnce(Result<(), PublishError>) + 'static,
    ) {
        match Command::mpub(topic, bodies) {
            Ok(cmd) => self.send_command(cmd, callback),
            Err(err) => callback(Err(err.into())),
        }
    }

    pub fn dpub(
        &mut self,
        topic: &str,
        delay_ms: u32,
        body: Vec<u8>,
        callback: impl FnOnce(Result<(), PublishError>) + 'static,
    ) {
        match Command::dpub(topic, delay_ms, body) {
            Ok(cmd) => self.send_command(cmd, callback),
            Err(err) => callback(Err(err.into())),
        }
    }

    fn send_command(&mut self, cmd: Command, callback: impl FnOnce(Result<(), PublishError>) + 'static) {
        let Some(token) = self.pick_connected() else {
            callback(Err(PublishError::NotConnected));
            return;
        };
        let Some(conn) = self.connections.get(&token).cloned() else {
            callback(Err(PublishError::NotConnected));
            return;
        };
        conn.send(&cmd);
        self.flush_outbox(token, &conn);
        self.callbacks.entry(token).or_default().push_back(Box::new(callback));
    }

    fn pick_connected(&self) -> Option<Token> {
        let ready: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnState::Connected)
            .map(|(t, _)| *t)
            .collect();
        if ready.is_empty() {
            return None;
        }
        Some(ready[rand::rng().random_range(0..ready.len())])
    }

    /// Services mio readiness for up to `timeout` and runs due reconnects.
    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }

        let mut incoming = Vec::new();
        self.connector.poll_with(timeout, |event| match event {
            PollEvent::Frame { token, frame } => incoming.push((token, frame.to_vec())),
            PollEvent::Disconnected { token } => incoming.push((token, Vec::new())),
        })?;

        for (token, bytes) in incoming {
            if bytes.is_empty() {
                self.on_disconnected(token);
            } else {
                self.on_wire_frame(token, &bytes);
            }
        }

        let due: Vec<_> = self
            .reconnect_at
            .iter()
            .filter(|(_, deadline)| Instant::now() >= **deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for (host, port) in due {
            self.reconnect_at.remove(&(host.clone(), port));
            if let Ok(addr) = format!("{host}:{port}").parse() {
                self.connect_to(addr);
            }
        }

        Ok(())
    }

    fn on_wire_frame(&mut self, token: Token, bytes: &[u8]) {
        let Some(conn) = self.connections.get(&token).cloned() else { return };

        match decode_frame(bytes) {
            Ok(Frame::Message(_)) => {
                warn!("producer connection received a MESSAGE frame, which should never happen");
            }
            Ok(decoded) => conn.on_frame(decoded),
            Err(err) => {
                warn!(%err, "producer: failed to decode frame, closing connection");
                conn.close();
            }
        }
        self.flush_outbox(token, &conn);

        for event in conn.drain_events() {
            match event {
                ConnEvent::Response(_) => self.complete_one(token, Ok(())),
                ConnEvent::Error(kind) => self.complete_one(token, Err(PublishError::Server(kind))),
                ConnEvent::Close => self.on_disconnected(token),
                ConnEvent::Ready
                | ConnEvent::Connect
                | ConnEvent::IdentifyResponse { .. }
                | ConnEvent::Heartbeat
                | ConnEvent::Backoff
                | ConnEvent::Continue
                | ConnEvent::Resume => {}
            }
        }
    }

    fn complete_one(&mut self, token: Token, result: Result<(), PublishError>) {
        if let Some(queue) = self.callbacks.get_mut(&token) {
            nsq_utils::safe_assert!(!queue.is_empty(), "response frame with no queued publish callback");
            if let Some(callback) = queue.pop_front() {
                callback(result);
            }
        }
    }

    fn on_disconnected(&mut self, token: Token) {
        let Some(conn) = self.connections.remove(&token) else { return };
        conn.close();
        let host = conn.host();
        let port = conn.port();

        if let Some(mut queue) = self.callbacks.remove(&token) {
            while let Some(callback) = queue.pop_front() {
                callback(Err(PublishError::ConnectionClosed));
            }
        }

        self.reconnect_at.insert((host, port), Instant::now() + self.config.reconnect_interval);
    }

    fn flush_outbox(&mut self, token: Token, conn: &Connection) {
        for bytes in conn.drain_outbox() {
            self.connector.write_or_enqueue(token, &bytes);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let tokens: Vec<_> = self.connections.keys().copied().collect();
        for token in tokens {
            self.connector.close(token);
        }
        self.connections.clear();
        for (_, mut queue) in self.callbacks.drain() {
            while let Some(callback) = queue.pop_front() {
                callback(Err(PublishError::ConnectionClosed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[test]
    fn rejects_empty_endpoint_list() {
        let err = Writer::new(ProducerConfig::new(Vec::new()));
        assert!(matches!(err, Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn publish_with_no_connected_endpoint_fails_synchronously() {
        // Nothing is listening on this address, so the connection stays in
        // `Connecting` (never reaches `Connected`) and `pub_` must invoke
        // its callback synchronously with `NotConnected` per S6.
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut writer = Writer::new(ProducerConfig::new(vec![addr])).unwrap();

        let result = Rc::new(RefCell::new(None));
        let captured = result.clone();
        writer.pub_("orders", b"hello".to_vec(), move |r| {
            *captured.borrow_mut() = Some(r);
        });

        assert!(matches!(*result.borrow(), Some(Err(PublishError::NotConnected))));
    }
}
