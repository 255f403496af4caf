use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::mpsc::{self, Receiver},
};

use mio::Token;
use nsq_core::{BackoffConfig, BackoffTimer, Connection, Event as ConnEvent};
use nsq_net::{PollEvent, TcpConnector};
use nsq_protocol::{decode_frame, Command, Frame};
use nsq_timing::{Duration, Instant, Repeater};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    config::ConsumerConfig,
    discovery::{DiscoveryClient, DiscoveryResult},
    error::ConfigError,
    handler::MessageHandler,
};

const REDISTRIBUTE_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(15);
const CONNECT_THROTTLE: Duration = Duration::from_secs(10);
const RDY_RETRY_DELAY: Duration = Duration::from_secs(15);
const RDY_HEADROOM_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Multi-connection coordinator: discovers producers, maintains the live
/// connection set, apportions RDY credit across it, and drives the global
/// backoff controller. The event loop is a single-threaded cooperative
/// loop — call [`Reader::poll`] repeatedly from whatever drives your
/// process (a `loop {}`, a signal-driven tick, etc.).
pub struct Reader {
    config: ConsumerConfig,
    connector: TcpConnector,
    handler: Box<dyn MessageHandler>,

    connections: HashMap<Token, Connection>,
    id_to_token: HashMap<String, Token>,
    last_connect_attempt: HashMap<String, Instant>,
    reconnect_at: HashMap<(String, u16), Instant>,

    total_rdy: u32,
    max_in_flight: u32,
    disabled: bool,

    backoff: BackoffTimer,
    backoff_block: bool,
    backoff_block_completed: bool,
    backoff_timeout: Option<Instant>,
    need_rdy_redistributed: bool,

    rdy_retries: HashMap<Token, (Instant, u32)>,

    redistribute: Repeater,

    discovery: Option<DiscoveryClient>,
    discovery_results: Option<Receiver<DiscoveryResult>>,
    discovery_next_poll: Instant,
    lookupd_rr: usize,

    closed: bool,
}

impl Reader {
    pub fn new(
        config: ConsumerConfig,
        handler: impl MessageHandler + 'static,
    ) -> Result<Self, ConfigError> {
        nsq_protocol::valid_topic_name(&config.topic)?;
        nsq_protocol::valid_channel_name(&config.channel)?;

        if config.nsqd_endpoints.is_empty() && config.lookupd_endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let backoff = BackoffTimer::new(BackoffConfig {
            max_interval: config.max_backoff_duration,
            ..BackoffConfig::default()
        });

        let (discovery, discovery_results) = if config.lookupd_endpoints.is_empty() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel();
            (Some(DiscoveryClient::spawn(tx)), Some(rx))
        };

        let jitter_fraction = config.lookupd_poll_jitter.max(0.0);
        let jitter = if jitter_fraction > 0.0 {
            rand::rng().random_range(0.0..jitter_fraction) * config.lookupd_poll_interval.as_secs_f64()
        } else {
            0.0
        };

        let mut reader = Self {
            connector: TcpConnector::new().map_err(|_| ConfigError::NoEndpoints)?,
            max_in_flight: config.max_in_flight,
            discovery_next_poll: Instant::now() + Duration::from_secs_f64(jitter),
            config,
            handler: Box::new(handler),
            connections: HashMap::new(),
            id_to_token: HashMap::new(),
            last_connect_attempt: HashMap::new(),
            reconnect_at: HashMap::new(),
            total_rdy: 0,
            disabled: false,
            backoff,
            backoff_block: false,
            backoff_block_completed: true,
            backoff_timeout: None,
            need_rdy_redistributed: false,
            rdy_retries: HashMap::new(),
            redistribute: Repeater::every(REDISTRIBUTE_INTERVAL),
            discovery,
            discovery_results,
            lookupd_rr: 0,
            closed: false,
        };

        for addr in reader.config.nsqd_endpoints.clone() {
            reader.connect_to_nsqd(addr);
        }

        Ok(reader)
    }

    /// One cooperative tick: services mio readiness for up to `timeout`,
    /// drains any lookupd results that arrived from the discovery thread,
    /// and runs due periodic work (redistribution, RDY retries, reconnects,
    /// discovery polls).
    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }

        self.drain_discovery_results();

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

        self.service_timers();
        Ok(())
    }

    // -- discovery ---------------------------------------------------

    fn drain_discovery_results(&mut self) {
        let Some(rx) = &self.discovery_results else { return };
        let results: Vec<_> = rx.try_iter().collect();
        for result in results {
            for addr in result.producers {
                self.connect_to_nsqd(addr);
            }
        }
    }

    fn maybe_poll_discovery(&mut self) {
        let Some(discovery) = &self.discovery else { return };
        if Instant::now() < self.discovery_next_poll {
            return;
        }
        if !self.config.lookupd_endpoints.is_empty() {
            let endpoint = &self.config.lookupd_endpoints[self.lookupd_rr % self.config.lookupd_endpoints.len()];
            discovery.query(endpoint, &self.config.topic);
            self.lookupd_rr = self.lookupd_rr.wrapping_add(1);
        }
        self.discovery_next_poll = Instant::now() + self.config.lookupd_poll_interval;
    }

    // -- connection lifecycle ----------------------------------------

    fn connect_to_nsqd(&mut self, addr: SocketAddr) {
        let id = addr.to_string();
        if self.id_to_token.contains_key(&id) {
            return;
        }
        if let Some(last) = self.last_connect_attempt.get(&id) {
            if last.elapsed() < CONNECT_THROTTLE {
                return;
            }
        }
        self.last_connect_attempt.insert(id.clone(), Instant::now());

        let token = match self.connector.connect(addr) {
            Ok(token) => token,
            Err(err) => {
                warn!(%addr, %err, "failed to connect to nsqd");
                return;
            }
        };

        let conn = Connection::new(addr.ip().to_string(), addr.port(), token, self.config.connection.clone());
        conn.begin_connect();
        self.flush_outbox(token, &conn);
        self.connections.insert(token, conn);
        self.id_to_token.insert(id, token);
    }

    fn on_disconnected(&mut self, token: Token) {
        let Some(conn) = self.connections.remove(&token) else { return };
        conn.close();
        let id = conn.id();
        self.id_to_token.remove(&id);
        self.rdy_retries.remove(&token);

        let rdy = conn.rdy();
        self.total_rdy = self.total_rdy.saturating_sub(rdy);
        if rdy > 0 && (self.connections.len() as u32 == self.max_in_flight || self.in_backoff()) {
            self.need_rdy_redistributed = true;
        }

        if self.config.lookupd_endpoints.is_empty() {
            self.reconnect_at.insert((conn.host(), conn.port()), Instant::now() + RECONNECT_DELAY);
        }

        info!(%id, "nsqd connection closed");
    }

    fn on_wire_frame(&mut self, token: Token, bytes: &[u8]) {
        let Some(conn) = self.connections.get(&token).cloned() else { return };

        match decode_frame(bytes) {
            Ok(Frame::Message(raw)) => {
                let attempts = raw.attempts;
                let mut message = conn.on_message_frame(raw);
                // `on_message_frame` just decremented this connection's own
                // `rdy`; mirror that here so `total_rdy` stays the true sum
                // of every connection's `rdy` rather than drifting high.
                self.total_rdy = self.total_rdy.saturating_sub(1);
                self.flush_outbox(token, &conn);
                self.maybe_hot_swap_rdy(&conn);
                // RDY top-up happens before dispatch, not after finish/requeue,
                // so a tentative RDY 1 connection reaches full throttle on the
                // wire ahead of the FIN/REQ for the message that triggered it.
                self.maybe_update_rdy(&conn);

                if self.config.max_tries > 0 && u32::from(attempts) > self.config.max_tries {
                    self.handler.giving_up(&mut message);
                    if !message.has_responded() {
                        message.finish();
                    }
                } else {
                    self.handler.preprocess(&mut message);
                    if !self.handler.validate(&message) {
                        if !message.has_responded() {
                            message.finish();
                        }
                    } else {
                        let handled = self.handler.handle(&mut message);
                        if !message.is_async() && !message.has_responded() {
                            if handled {
                                message.finish();
                            } else {
                                message.requeue(None, true);
                            }
                        }
                    }
                }
                self.flush_outbox(token, &conn);
                self.drain_connection_events(token, &conn);
            }
            Ok(decoded) => {
                conn.on_frame(decoded);
                self.flush_outbox(token, &conn);
                self.drain_connection_events(token, &conn);
            }
            Err(err) => {
                warn!(%err, "failed to decode frame, closing connection");
                conn.close();
                self.drain_connection_events(token, &conn);
            }
        }
    }

    fn drain_connection_events(&mut self, token: Token, conn: &Connection) {
        for event in conn.drain_events() {
            match event {
                ConnEvent::Ready => {
                    let cmd = Command::sub(&self.config.topic, &self.config.channel);
                    match cmd {
                        Ok(cmd) => conn.send(&cmd),
                        Err(err) => warn!(%err, "failed to build SUB command"),
                    }
                    self.flush_outbox(token, conn);
                    self.on_ready(token, conn);
                }
                ConnEvent::Backoff => {
                    self.backoff.failure();
                    self.enter_or_continue_or_exit_backoff();
                }
                ConnEvent::Continue => {
                    // Neutral: neither success nor failure for the backoff controller.
                }
                ConnEvent::Resume => {
                    if !self.backoff_block {
                        self.backoff.success();
                    }
                    self.enter_or_continue_or_exit_backoff();
                    self.maybe_update_rdy(conn);
                }
                ConnEvent::Close => self.on_disconnected(token),
                ConnEvent::Error(kind) => debug!(%kind, "server error"),
                ConnEvent::Heartbeat | ConnEvent::Connect | ConnEvent::IdentifyResponse { .. } => {}
                ConnEvent::Response(_) => {}
            }
        }
    }

    fn on_ready(&mut self, token: Token, conn: &Connection) {
        // Race check: another connection to the same id may have beaten us
        // through negotiation first.
        let id = conn.id();
        if self.id_to_token.get(&id).copied() != Some(token) {
            conn.close();
            return;
        }

        let target = self.per_connection_target();
        let to_throttle: Vec<Connection> =
            self.connections.values().filter(|c| c.rdy() > target).cloned().collect();
        for other in to_throttle {
            self.send_rdy(&other, target);
        }

        if !self.in_backoff() || self.connections.len() == 1 {
            self.send_rdy(conn, 1);
        }
    }

    // -- RDY arithmetic ------------------------------------------------

    fn per_connection_target(&self) -> u32 {
        per_connection_target(self.max_in_flight, self.connections.len().max(1))
    }

    fn send_rdy(&mut self, conn: &Connection, value: u32) {
        self.rdy_retries.remove(&conn.token());

        if value > 0 && (self.disabled || self.max_in_flight == 0) {
            self.rdy_retries.insert(conn.token(), (Instant::now() + RDY_RETRY_DELAY, value));
            return;
        }

        let clamped = value.min(conn.max_rdy_count());
        let proposed_total = self.total_rdy - conn.rdy() + clamped;
        if proposed_total > self.max_in_flight {
            if conn.rdy() == 0 && clamped > 0 {
                self.rdy_retries.insert(conn.token(), (Instant::now() + RDY_HEADROOM_RETRY_DELAY, value));
            }
            return;
        }

        self.total_rdy = proposed_total;
        conn.send_rdy(clamped);
        self.flush_outbox(conn.token(), conn);
        nsq_utils::safe_assert!(
            self.total_rdy <= self.max_in_flight,
            "RDY oversubscribed: total_rdy={} max_in_flight={}",
            self.total_rdy,
            self.max_in_flight
        );
    }

    fn maybe_update_rdy(&mut self, conn: &Connection) {
        if self.in_backoff() || self.max_in_flight == 0 {
            return;
        }
        let target = self.per_connection_target();
        if conn.rdy() == 1 || conn.rdy() != target {
            self.send_rdy(conn, target);
        }
    }

    fn maybe_hot_swap_rdy(&mut self, _conn: &Connection) {
        // Redistribution already rotates credit across connections on its
        // own periodic pass; a faster per-message hot swap on oversubscription
        // is subsumed by that pass running every 5s here rather than wiring a
        // second, faster timer solely for this purpose.
    }

    // -- backoff state machine ------------------------------------------

    fn in_backoff(&self) -> bool {
        self.backoff_block || !self.backoff_block_completed
    }

    fn enter_or_continue_or_exit_backoff(&mut self) {
        if self.backoff_block {
            return;
        }
        if !self.backoff_block_completed && self.backoff.interval().is_zero() {
            self.backoff_block_completed = true;
            let target = self.per_connection_target();
            let tokens: Vec<_> = self.connections.keys().copied().collect();
            for token in tokens {
                if let Some(conn) = self.connections.get(&token).cloned() {
                    self.send_rdy(&conn, target);
                }
            }
        } else if !self.backoff.interval().is_zero() {
            self.backoff_block = true;
            self.backoff_block_completed = false;
            let tokens: Vec<_> = self.connections.keys().copied().collect();
            for token in tokens {
                if let Some(conn) = self.connections.get(&token).cloned() {
                    self.send_rdy(&conn, 0);
                }
            }
            self.backoff_timeout = Some(Instant::now() + self.backoff.interval());
        }
    }

    fn finish_backoff_block(&mut self) {
        self.backoff_block = false;
        if self.backoff.interval().is_zero() {
            self.backoff_block_completed = true;
            let target = self.per_connection_target();
            let tokens: Vec<_> = self.connections.keys().copied().collect();
            for token in tokens {
                if let Some(conn) = self.connections.get(&token).cloned() {
                    self.send_rdy(&conn, target);
                }
            }
        } else if !self.connections.is_empty() && self.max_in_flight > 0 {
            let tokens: Vec<_> = self.connections.keys().copied().collect();
            let pick = tokens[rand::rng().random_range(0..tokens.len())];
            if let Some(conn) = self.connections.get(&pick).cloned() {
                self.send_rdy(&conn, 1);
            }
        }
    }

    // -- redistribution --------------------------------------------------

    fn redistribute_rdy(&mut self) {
        if self.disabled || self.max_in_flight == 0 {
            return;
        }

        let idle_tokens: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| c.rdy() > 0 && c.last_msg_ts().elapsed() > self.config.low_rdy_idle_timeout)
            .map(|(t, _)| *t)
            .collect();
        for token in idle_tokens {
            if let Some(conn) = self.connections.get(&token).cloned() {
                self.send_rdy(&conn, 0);
            }
        }

        let budget = if self.in_backoff() { 1 } else { self.max_in_flight };
        let occupied =
            self.connections.values().filter(|c| c.in_flight() > 0 || c.rdy() > 0).count() as u32;
        let mut available = budget.saturating_sub(occupied);

        if available == 0 {
            let in_flight: Vec<_> =
                self.connections.iter().filter(|(_, c)| c.in_flight() > 0).map(|(t, _)| *t).collect();
            if !in_flight.is_empty() {
                let pick = in_flight[rand::rng().random_range(0..in_flight.len())];
                if let Some(conn) = self.connections.get(&pick).cloned() {
                    self.send_rdy(&conn, 0);
                }
            }
        }

        let mut idle: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, c)| c.in_flight() == 0 && c.rdy() == 0)
            .map(|(t, _)| *t)
            .collect();
        while available > 0 && !idle.is_empty() {
            let index = rand::rng().random_range(0..idle.len());
            let token = idle.swap_remove(index);
            if let Some(conn) = self.connections.get(&token).cloned() {
                self.send_rdy(&conn, 1);
            }
            available -= 1;
        }

        self.need_rdy_redistributed = false;
    }

    // -- timers ----------------------------------------------------------

    fn service_timers(&mut self) {
        self.maybe_poll_discovery();

        if let Some(deadline) = self.backoff_timeout {
            if Instant::now() >= deadline {
                self.backoff_timeout = None;
                self.finish_backoff_block();
            }
        }

        let due_retries: Vec<_> = self
            .rdy_retries
            .iter()
            .filter(|(_, (deadline, _))| Instant::now() >= *deadline)
            .map(|(token, (_, value))| (*token, *value))
            .collect();
        for (token, value) in due_retries {
            self.rdy_retries.remove(&token);
            if let Some(conn) = self.connections.get(&token).cloned() {
                self.send_rdy(&conn, value);
            }
        }

        let due_reconnects: Vec<_> = self
            .reconnect_at
            .iter()
            .filter(|(_, deadline)| Instant::now() >= **deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for (host, port) in due_reconnects {
            self.reconnect_at.remove(&(host.clone(), port));
            if let Ok(addr) = format!("{host}:{port}").parse() {
                self.connect_to_nsqd(addr);
            }
        }

        if self.redistribute.fired() || self.need_rdy_redistributed {
            self.redistribute_rdy();
        }
    }

    fn flush_outbox(&mut self, token: Token, conn: &Connection) {
        for bytes in conn.drain_outbox() {
            self.connector.write_or_enqueue(token, &bytes);
        }
    }

    // -- control API -------------------------------------------------

    pub fn set_message_handler(&mut self, handler: impl MessageHandler + 'static) {
        self.handler = Box::new(handler);
    }

    pub fn set_max_in_flight(&mut self, n: u32) {
        self.max_in_flight = n;
        if n == 0 {
            self.disabled = true;
            let tokens: Vec<_> = self.connections.keys().copied().collect();
            for token in tokens {
                if let Some(conn) = self.connections.get(&token).cloned() {
                    self.send_rdy(&conn, 0);
                }
            }
        } else {
            self.disabled = false;
            self.need_rdy_redistributed = true;
        }
    }

    pub fn is_starved(&self) -> bool {
        self.connections
            .values()
            .any(|c| c.last_rdy() > 0 && f64::from(c.in_flight()) >= 0.85 * f64::from(c.last_rdy()))
    }

    pub fn total_rdy(&self) -> u32 {
        self.total_rdy
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
        self.id_to_token.clear();
    }
}

pub(crate) fn per_connection_target(max_in_flight: u32, conn_count: usize) -> u32 {
    (max_in_flight / (conn_count as u32).max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_target_floors_to_one() {
        assert_eq!(per_connection_target(3, 5), 1);
        assert_eq!(per_connection_target(10, 2), 5);
        assert_eq!(per_connection_target(0, 1), 1);
    }

    fn noop_handler(_: &mut nsq_core::Message) -> bool {
        true
    }

    #[test]
    fn rejects_empty_endpoint_lists() {
        let config = ConsumerConfig::new("orders", "worker");
        let err = Reader::new(config, noop_handler);
        assert!(matches!(err, Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn rejects_invalid_topic_name() {
        let mut config = ConsumerConfig::new("bad topic", "worker");
        config.nsqd_endpoints.push("127.0.0.1:4150".parse().unwrap());
        let err = Reader::new(config, noop_handler);
        assert!(matches!(err, Err(ConfigError::InvalidName(_))));
    }

    #[test]
    fn accepts_a_single_static_endpoint() {
        let mut config = ConsumerConfig::new("orders", "worker");
        config.nsqd_endpoints.push("127.0.0.1:1".parse().unwrap());
        let reader = Reader::new(config, noop_handler).unwrap();
        assert_eq!(reader.connection_count(), 1);
    }

    #[test]
    fn redistribute_rdy_caps_total_at_max_in_flight() {
        let mut config = ConsumerConfig::new("orders", "worker");
        config.max_in_flight = 3;
        for port in 1..=5u16 {
            config.nsqd_endpoints.push(format!("127.0.0.1:{port}").parse().unwrap());
        }
        let mut reader = Reader::new(config, noop_handler).unwrap();

        reader.redistribute_rdy();

        assert_eq!(reader.total_rdy(), 3);
        let with_rdy = reader.connections.values().filter(|c| c.rdy() == 1).count();
        assert_eq!(with_rdy, 3);
    }

    #[test]
    fn discovered_producers_each_get_their_own_connection() {
        let mut config = ConsumerConfig::new("orders", "worker");
        config.lookupd_endpoints.push("http://127.0.0.1:4161".into());
        let mut reader = Reader::new(config, noop_handler).unwrap();
        assert_eq!(reader.connection_count(), 0);

        for port in 10..13u16 {
            reader.connect_to_nsqd(format!("127.0.0.1:{port}").parse().unwrap());
        }
        assert_eq!(reader.connection_count(), 3);
    }
}
