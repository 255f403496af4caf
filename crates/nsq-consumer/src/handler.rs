use nsq_core::Message;

/// The user's per-message callback. A plain `FnMut(&mut Message) -> bool`
/// implements this automatically; implement the trait directly when
/// `giving_up` needs to do more than log.
///
/// `handle`'s return value is only consulted when the message was not
/// marked async (see `Message::enable_async`): `true` finishes it, `false`
/// requeues it. A panicking handler is not caught here; it unwinds through
/// `Reader::poll` like any other panic.
pub trait MessageHandler {
    fn handle(&mut self, message: &mut Message) -> bool;

    /// Called instead of `handle` when `message.attempts() > max_tries`.
    /// Default: log and let the caller finish the message so nsqd stops
    /// redelivering it.
    fn giving_up(&mut self, message: &mut Message) {
        tracing::warn!(attempts = message.attempts(), "giving up on message after max_tries");
    }

    /// Runs before `validate`/`handle` on every delivered message. Default:
    /// no-op. Override to mutate or inspect the message ahead of dispatch
    /// (e.g. decompressing a body the producer packed).
    fn preprocess(&mut self, _message: &mut Message) {}

    /// Runs after `preprocess`, before `handle`. Returning `false` finishes
    /// the message without ever calling `handle`. Default: always valid.
    fn validate(&mut self, _message: &Message) -> bool {
        true
    }
}

impl<F> MessageHandler for F
where
    F: FnMut(&mut Message) -> bool,
{
    fn handle(&mut self, message: &mut Message) -> bool {
        self(message)
    }
}
