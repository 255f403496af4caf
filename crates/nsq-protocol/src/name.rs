use crate::error::ProtocolError;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || c == b'-'
}

/// `^[.a-zA-Z0-9_-]+$`, 1..=64 bytes, hand-rolled rather than pulled in from
/// a regex engine since nothing else in this workspace needs one.
pub fn valid_topic_name(topic: &str) -> Result<(), ProtocolError> {
    let bytes = topic.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN || !bytes.iter().copied().all(is_name_char) {
        return Err(ProtocolError::InvalidTopicName(topic.to_owned()));
    }
    Ok(())
}

/// Same character class as a topic name, with an optional `#ephemeral`
/// suffix that does not count against the 64-byte limit.
pub fn valid_channel_name(channel: &str) -> Result<(), ProtocolError> {
    let base = channel.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(channel);
    let bytes = base.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN || !bytes.iter().copied().all(is_name_char) {
        return Err(ProtocolError::InvalidChannelName(channel.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(valid_topic_name("orders.created").is_ok());
        assert!(valid_channel_name("worker_1").is_ok());
    }

    #[test]
    fn accepts_ephemeral_channel() {
        assert!(valid_channel_name("tmp-channel#ephemeral").is_ok());
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(valid_topic_name("").is_err());
        assert!(valid_topic_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn accepts_names_up_to_64_bytes() {
        assert!(valid_topic_name(&"a".repeat(64)).is_ok());
        assert!(valid_topic_name(&"a".repeat(33)).is_ok());
    }

    #[test]
    fn rejects_disallowed_characters() {
        assert!(valid_topic_name("bad topic").is_err());
        assert!(valid_channel_name("bad/channel").is_err());
    }
}
