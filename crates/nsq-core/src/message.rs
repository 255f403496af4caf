use std::rc::Rc;

use nsq_utils::safe_panic;

/// Opaque 16-byte message identity as sent on the wire.
pub type MessageId = [u8; 16];

/// Sink a [`Message`] writes its terminal (or non-terminal touch) response
/// through. Implemented by the owning `Connection`; kept as a trait so
/// `nsq-core` doesn't need to know about `nsq-net` sockets here.
///
/// The event loop is single-threaded (see the crate's concurrency model),
/// so this is an `Rc`, not an `Arc`.
pub trait MessageResponder {
    fn respond_finish(&self, id: MessageId);
    fn respond_requeue(&self, id: MessageId, attempts: u16, delay_ms: Option<u32>, backoff: bool);
    fn respond_touch(&self, id: MessageId);
}

/// A message delivered off a MESSAGE frame. Immutable identity; mutable
/// only in whether it has already produced a terminal response.
///
/// Invariant: exactly one of `finish`/`requeue` is ever called per message.
/// `touch` may be called any number of times before that terminal call.
/// Calling a terminal method twice, or any method after a terminal one, is
/// a caller bug and is reported via `safe_panic!` rather than silently
/// ignored or given an `Err` return — this mirrors the source's bare
/// `assert not self._has_responded`.
pub struct Message {
    id: MessageId,
    timestamp: i64,
    attempts: u16,
    body: Vec<u8>,
    async_enabled: bool,
    responded: bool,
    responder: Rc<dyn MessageResponder>,
}

impl Message {
    pub fn new(
        id: MessageId,
        timestamp: i64,
        attempts: u16,
        body: Vec<u8>,
        responder: Rc<dyn MessageResponder>,
    ) -> Self {
        Self { id, timestamp, attempts, body, async_enabled: false, responded: false, responder }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Marks this message as handled asynchronously: the handler's return
    /// value is ignored and `finish`/`requeue` will be called later, out of
    /// band, by whatever code retained the message.
    pub fn enable_async(&mut self) {
        self.async_enabled = true;
    }

    pub fn is_async(&self) -> bool {
        self.async_enabled
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    pub fn finish(&mut self) {
        if self.responded {
            safe_panic!("Message::finish called after a terminal response was already sent");
            return;
        }
        self.responded = true;
        self.responder.respond_finish(self.id);
    }

    /// `delay_ms`: `None` lets the connection derive the standard
    /// `requeue_delay_base * attempts * 1000` backoff-aware delay.
    /// `backoff`: whether this requeue should count as a controller
    /// failure (drives the consumer's backoff timer).
    pub fn requeue(&mut self, delay_ms: Option<u32>, backoff: bool) {
        if self.responded {
            safe_panic!("Message::requeue called after a terminal response was already sent");
            return;
        }
        self.responded = true;
        self.responder.respond_requeue(self.id, self.attempts, delay_ms, backoff);
    }

    pub fn touch(&self) {
        if self.responded {
            safe_panic!("Message::touch called after a terminal response was already sent");
            return;
        }
        self.responder.respond_touch(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingResponder {
        calls: RefCell<Vec<String>>,
    }

    impl MessageResponder for RecordingResponder {
        fn respond_finish(&self, _id: MessageId) {
            self.calls.borrow_mut().push("finish".into());
        }

        fn respond_requeue(&self, _id: MessageId, _attempts: u16, _delay_ms: Option<u32>, backoff: bool) {
            self.calls.borrow_mut().push(format!("requeue(backoff={backoff})"));
        }

        fn respond_touch(&self, _id: MessageId) {
            self.calls.borrow_mut().push("touch".into());
        }
    }

    fn message(responder: Rc<RecordingResponder>) -> Message {
        Message::new([1u8; 16], 0, 1, b"body".to_vec(), responder)
    }

    #[test]
    fn finish_is_terminal() {
        let responder = Rc::new(RecordingResponder::default());
        let mut msg = message(responder.clone());
        msg.finish();
        assert!(msg.has_responded());
        assert_eq!(*responder.calls.borrow(), vec!["finish"]);
    }

    #[test]
    fn touch_then_finish_is_allowed() {
        let responder = Rc::new(RecordingResponder::default());
        let mut msg = message(responder.clone());
        msg.touch();
        msg.finish();
        assert_eq!(*responder.calls.borrow(), vec!["touch", "finish"]);
    }

    #[test]
    fn async_flag_defaults_false() {
        let responder = Rc::new(RecordingResponder::default());
        let mut msg = message(responder);
        assert!(!msg.is_async());
        msg.enable_async();
        assert!(msg.is_async());
    }
}
