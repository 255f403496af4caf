use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use mio::Token;
use nsq_protocol::{is_heartbeat, is_ok_response, Command, Frame, ServerErrorKind};
use nsq_timing::{Duration, Instant};
use nsq_utils::safe_assert;
use tracing::{info, trace, warn};

use crate::message::{Message, MessageId, MessageResponder};

/// INIT -> CONNECTING -> CONNECTED -> DISCONNECTED lifecycle.
/// `connect()` is a no-op outside `{Init, Disconnected}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    Disconnected,
}

/// What IDENTIFY/AUTH step, if any, negotiation is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NegotiationStep {
    AwaitingIdentifyResponse,
    AwaitingAuthResponse,
    Done,
}

/// Server-advertised IDENTIFY response fields this connection cares about.
#[derive(Clone, Debug, Default, serde::Deserialize)]
struct IdentifyResponse {
    #[serde(default = "default_max_rdy_count")]
    max_rdy_count: u32,
    #[serde(default)]
    auth_required: bool,
}

fn default_max_rdy_count() -> u32 {
    2500
}

/// Negotiable connection-level knobs, forwarded verbatim into the IDENTIFY
/// body. Stream-transform negotiation (TLS/Snappy/Deflate) is not offered:
/// no coordinator installs a codec against the live `nsq-net` socket, so
/// advertising support for it here would wedge the connection waiting on a
/// feature-ack `OK` nothing ever prompted the server to send.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
    pub output_buffer_size: u32,
    pub output_buffer_timeout: Duration,
    pub sample_rate: u8,
    pub msg_timeout: Duration,
    pub auth_secret: Option<String>,
    /// `requeue_delay_base * attempts * 1000` is the default requeue delay
    /// (ms) when a handler requeues without specifying one.
    pub requeue_delay_base: u32,
}

/// Events a `Connection` emits as it processes frames and message
/// responses. The Consumer/Producer subscribes to these to drive RDY
/// arithmetic, the backoff controller, and callback queues — a tagged
/// variant delivered over a drainable queue rather than string-keyed
/// listeners.
#[derive(Debug)]
pub enum Event {
    Connect,
    IdentifyResponse { max_rdy_count: u32, auth_required: bool },
    Ready,
    Response(Vec<u8>),
    Heartbeat,
    Error(ServerErrorKind),
    Close,
    /// Emitted by a requeue with `backoff=true`.
    Backoff,
    /// Emitted by a requeue with `backoff=false`.
    Continue,
    /// Emitted by finish.
    Resume,
}

struct Inner {
    host: String,
    port: u16,
    token: Token,
    state: ConnState,
    config: ConnectionConfig,

    rdy: u32,
    last_rdy: u32,
    in_flight: u32,
    max_rdy_count: u32,
    auth_required: bool,

    negotiation: NegotiationStep,

    last_recv_ts: Instant,
    last_msg_ts: Instant,

    outbox: Vec<Vec<u8>>,
    events: VecDeque<Event>,
    close_emitted: bool,
}

/// A single NSQ TCP session. Frame decoding happens one layer down (in
/// `nsq-protocol`/`nsq-net`); this type only holds the negotiation and
/// RDY/in-flight state machine and turns incoming frames into `Event`s and
/// outgoing commands into queued bytes.
///
/// Cheaply cloneable (`Rc`): a clone is handed to every `Message` this
/// connection delivers so the message can write its own FIN/REQ/TOUCH back
/// without the connection needing to track message-to-response plumbing
/// itself.
#[derive(Clone)]
pub struct Connection(Rc<RefCell<Inner>>);

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, token: Token, config: ConnectionConfig) -> Self {
        let now = Instant::now();
        Self(Rc::new(RefCell::new(Inner {
            host: host.into(),
            port,
            token,
            state: ConnState::Init,
            config,
            rdy: 0,
            last_rdy: 0,
            in_flight: 0,
            max_rdy_count: default_max_rdy_count(),
            auth_required: false,
            negotiation: NegotiationStep::Done,
            last_recv_ts: now,
            last_msg_ts: now,
            outbox: Vec::new(),
            events: VecDeque::new(),
            close_emitted: false,
        })))
    }

    pub fn id(&self) -> String {
        let inner = self.0.borrow();
        format!("{}:{}", inner.host, inner.port)
    }

    pub fn host(&self) -> String {
        self.0.borrow().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.0.borrow().port
    }

    pub fn token(&self) -> Token {
        self.0.borrow().token
    }

    pub fn state(&self) -> ConnState {
        self.0.borrow().state
    }

    pub fn rdy(&self) -> u32 {
        self.0.borrow().rdy
    }

    pub fn last_rdy(&self) -> u32 {
        self.0.borrow().last_rdy
    }

    pub fn in_flight(&self) -> u32 {
        self.0.borrow().in_flight
    }

    pub fn max_rdy_count(&self) -> u32 {
        self.0.borrow().max_rdy_count
    }

    pub fn last_msg_ts(&self) -> Instant {
        self.0.borrow().last_msg_ts
    }

    pub fn last_recv_ts(&self) -> Instant {
        self.0.borrow().last_recv_ts
    }

    /// `now - last_recv_ts > 2 * heartbeat_interval`: the connection has
    /// gone quiet long enough that its owning coordinator should treat it
    /// as stale and close it.
    pub fn is_stale(&self) -> bool {
        let inner = self.0.borrow();
        inner.last_recv_ts.elapsed() > inner.config.heartbeat_interval + inner.config.heartbeat_interval
    }

    /// Idempotent; a no-op outside `{Init, Disconnected}`. Queues the magic
    /// handshake and the IDENTIFY command, transitions to `Connecting`.
    pub fn begin_connect(&self) {
        let mut inner = self.0.borrow_mut();
        if !matches!(inner.state, ConnState::Init | ConnState::Disconnected) {
            return;
        }
        inner.state = ConnState::Connecting;
        inner.negotiation = NegotiationStep::AwaitingIdentifyResponse;
        inner.outbox.push(nsq_protocol::MAGIC_V2.to_vec());

        let identify_body = serde_json::json!({
            "client_id": inner.config.client_id,
            "hostname": inner.config.hostname,
            "user_agent": inner.config.user_agent,
            "heartbeat_interval": inner.config.heartbeat_interval.as_millis() as u64,
            "output_buffer_size": inner.config.output_buffer_size,
            "output_buffer_timeout": inner.config.output_buffer_timeout.as_millis() as u64,
            "sample_rate": inner.config.sample_rate,
            "msg_timeout": inner.config.msg_timeout.as_millis() as u64,
            "feature_negotiation": true,
        });
        match Command::identify(&identify_body) {
            Ok(cmd) => inner.outbox.push(cmd.to_bytes()),
            Err(err) => warn!(?err, "failed to encode IDENTIFY body"),
        }
        inner.events.push_back(Event::Connect);
    }

    /// Queues a raw command for writing. Used by the Consumer for `SUB`,
    /// which is not part of the negotiation Connection drives itself.
    pub fn send(&self, cmd: &Command) {
        self.0.borrow_mut().outbox.push(cmd.to_bytes());
    }

    /// Clamps to `max_rdy_count` and queues an `RDY` command, recording
    /// `rdy`/`last_rdy`. Global apportionment (`Σ rdy ≤ max_in_flight`) is
    /// the Consumer's responsibility; this only enforces the per-connection
    /// cap.
    pub fn send_rdy(&self, value: u32) {
        let mut inner = self.0.borrow_mut();
        let clamped = value.min(inner.max_rdy_count);
        inner.outbox.push(Command::Ready(clamped).to_bytes());
        inner.last_rdy = clamped;
        inner.rdy = clamped;
        trace!(conn = %format!("{}:{}", inner.host, inner.port), rdy = clamped, "sent RDY");
    }

    /// Drains and returns all bytes queued for writing since the last call.
    pub fn drain_outbox(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.0.borrow_mut().outbox)
    }

    /// Drains and returns all events emitted since the last call.
    pub fn drain_events(&self) -> Vec<Event> {
        self.0.borrow_mut().events.drain(..).collect()
    }

    /// Interprets one decoded non-message frame (`RESPONSE`/`ERROR`),
    /// updating negotiation/heartbeat state and enqueueing any follow-up
    /// commands or events. `MESSAGE` frames go through
    /// [`Connection::on_message_frame`] instead, since those hand back a
    /// [`Message`] rather than firing an event.
    pub fn on_frame(&self, frame: Frame) {
        self.0.borrow_mut().last_recv_ts = Instant::now();

        match frame {
            Frame::Message(_) => {
                warn!("MESSAGE frame passed to on_frame; caller should use on_message_frame");
            }
            Frame::Response(payload) => self.on_response(payload),
            Frame::Error(kind) => self.on_error(kind),
        }
    }

    /// Performs RDY/in-flight bookkeeping for a delivered `MESSAGE` frame
    /// and builds the handler-facing [`Message`], wired to respond through
    /// this same connection.
    pub fn on_message_frame(&self, raw: nsq_protocol::RawMessage) -> Message {
        let mut inner = self.0.borrow_mut();
        safe_assert!(inner.state == ConnState::Connected, "MESSAGE frame before READY");
        inner.in_flight += 1;
        inner.rdy = inner.rdy.saturating_sub(1);
        inner.last_msg_ts = Instant::now();
        drop(inner);

        Message::new(raw.id, raw.timestamp, raw.attempts, raw.body, Rc::new(self.clone()))
    }

    fn on_response(&self, payload: Vec<u8>) {
        if is_heartbeat(&payload) {
            self.0.borrow_mut().outbox.push(Command::Nop.to_bytes());
            self.0.borrow_mut().events.push_back(Event::Heartbeat);
            return;
        }

        let negotiating = {
            let inner = self.0.borrow();
            inner.state == ConnState::Connecting
        };

        if negotiating {
            self.on_negotiation_response(payload);
        } else {
            self.0.borrow_mut().events.push_back(Event::Response(payload));
        }
    }

    fn on_negotiation_response(&self, payload: Vec<u8>) {
        let step = self.0.borrow().negotiation;
        match step {
            NegotiationStep::AwaitingIdentifyResponse => {
                if is_ok_response(&payload) {
                    // Legacy server: no feature negotiation at all.
                    self.on_identify_response(default_max_rdy_count(), false);
                    return;
                }
                match serde_json::from_slice::<IdentifyResponse>(&payload) {
                    Ok(resp) => self.on_identify_response(resp.max_rdy_count, resp.auth_required),
                    Err(err) => {
                        warn!(?err, "malformed IDENTIFY response");
                        self.close();
                    }
                }
            }
            NegotiationStep::AwaitingAuthResponse => {
                if !is_ok_response(&payload) {
                    info!("AUTH rejected by server");
                }
                self.emit_ready();
            }
            NegotiationStep::Done => {
                // A RESPONSE arrived after negotiation already finished;
                // treat it like any ordinary response.
                self.0.borrow_mut().events.push_back(Event::Response(payload));
            }
        }
    }

    fn on_identify_response(&self, max_rdy_count: u32, auth_required: bool) {
        let mut inner = self.0.borrow_mut();
        inner.max_rdy_count = max_rdy_count;
        inner.auth_required = auth_required;
        drop(inner);

        self.0.borrow_mut().events.push_back(Event::IdentifyResponse { max_rdy_count, auth_required });
        self.maybe_send_auth();
    }

    fn maybe_send_auth(&self) {
        let (auth_required, secret) = {
            let inner = self.0.borrow();
            (inner.auth_required, inner.config.auth_secret.clone())
        };

        match (auth_required, secret) {
            (true, Some(secret)) => {
                self.0.borrow_mut().negotiation = NegotiationStep::AwaitingAuthResponse;
                self.0.borrow_mut().outbox.push(Command::Auth(secret.into_bytes()).to_bytes());
            }
            _ => self.emit_ready(),
        }
    }

    fn emit_ready(&self) {
        let mut inner = self.0.borrow_mut();
        inner.negotiation = NegotiationStep::Done;
        inner.state = ConnState::Connected;
        inner.events.push_back(Event::Ready);
    }

    fn on_error(&self, kind: ServerErrorKind) {
        let negotiating = self.0.borrow().state == ConnState::Connecting;
        let fatal = kind.is_fatal();
        self.0.borrow_mut().events.push_back(Event::Error(kind));
        // A server ERROR is non-fatal for the connection unless it
        // originates from a failed AUTH/IDENTIFY handshake.
        if negotiating && fatal {
            self.close();
        }
    }

    /// Idempotent. Transitions to `Disconnected` and emits `Close` exactly
    /// once.
    pub fn close(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.close_emitted {
            return;
        }
        inner.state = ConnState::Disconnected;
        inner.close_emitted = true;
        inner.events.push_back(Event::Close);
    }
}

impl MessageResponder for Connection {
    fn respond_finish(&self, id: MessageId) {
        let mut inner = self.0.borrow_mut();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.outbox.push(Command::Finish(hex_id(id)).to_bytes());
        inner.events.push_back(Event::Resume);
    }

    fn respond_requeue(&self, id: MessageId, attempts: u16, delay_ms: Option<u32>, backoff: bool) {
        let mut inner = self.0.borrow_mut();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        let delay = delay_ms.unwrap_or_else(|| {
            inner.config.requeue_delay_base.saturating_mul(u32::from(attempts)).saturating_mul(1000)
        });
        inner.outbox.push(Command::Requeue { id: hex_id(id), delay_ms: delay }.to_bytes());
        inner.events.push_back(if backoff { Event::Backoff } else { Event::Continue });
    }

    fn respond_touch(&self, id: MessageId) {
        self.0.borrow_mut().outbox.push(Command::Touch(hex_id(id)).to_bytes());
    }
}

fn hex_id(id: MessageId) -> String {
    let mut s = String::with_capacity(32);
    for byte in id {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            client_id: "test".into(),
            hostname: "test-host".into(),
            user_agent: "nsq-core/test".into(),
            heartbeat_interval: Duration::from_secs(30),
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            sample_rate: 0,
            msg_timeout: Duration::from_secs(60),
            auth_secret: None,
            requeue_delay_base: 90,
        }
    }

    #[test]
    fn connect_queues_magic_and_identify() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.begin_connect();
        let queued = conn.drain_outbox();
        assert_eq!(queued[0], nsq_protocol::MAGIC_V2);
        assert!(String::from_utf8_lossy(&queued[1]).starts_with("IDENTIFY\n"));
        assert_eq!(conn.state(), ConnState::Connecting);
    }

    #[test]
    fn legacy_ok_response_goes_straight_to_ready() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.begin_connect();
        conn.drain_outbox();
        conn.on_frame(Frame::Response(b"OK".to_vec()));
        assert_eq!(conn.state(), ConnState::Connected);
        assert!(conn.drain_events().iter().any(|e| matches!(e, Event::Ready)));
    }

    #[test]
    fn feature_negotiation_drives_to_ready() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.begin_connect();
        conn.drain_outbox();
        let identify_resp = serde_json::to_vec(&serde_json::json!({
            "max_rdy_count": 100,
            "auth_required": false,
        }))
        .unwrap();
        conn.on_frame(Frame::Response(identify_resp));
        assert_eq!(conn.max_rdy_count(), 100);
        assert!(conn.drain_events().iter().any(|e| matches!(e, Event::Ready)));
    }

    #[test]
    fn send_rdy_clamps_to_max_rdy_count() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.0.borrow_mut().max_rdy_count = 10;
        conn.send_rdy(50);
        assert_eq!(conn.rdy(), 10);
    }

    #[test]
    fn message_then_finish_round_trips_events() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.0.borrow_mut().state = ConnState::Connected;
        let raw = nsq_protocol::RawMessage { timestamp: 1, attempts: 1, id: [9; 16], body: vec![1] };
        let mut msg = conn.on_message_frame(raw);
        assert_eq!(conn.in_flight(), 1);
        msg.finish();
        assert_eq!(conn.in_flight(), 0);
        assert!(conn.drain_events().iter().any(|e| matches!(e, Event::Resume)));
    }

    #[test]
    fn close_is_idempotent() {
        let conn = Connection::new("127.0.0.1", 4150, Token(0), config());
        conn.close();
        conn.close();
        let closes = conn.drain_events().into_iter().filter(|e| matches!(e, Event::Close)).count();
        assert_eq!(closes, 1);
    }
}
