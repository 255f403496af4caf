use std::io::{self, Write};

use crate::{
    error::ProtocolError,
    name::{valid_channel_name, valid_topic_name},
};

/// A client-to-server command, encodable to any `Write`.
///
/// Every command is `<name>[ params...]\n[body]`, where `body` (when
/// present) is prefixed with its own 4-byte big-endian length. `MPUB`'s body
/// is itself a count followed by that many length-prefixed messages.
pub enum Command {
    Identify(Vec<u8>),
    Sub { topic: String, channel: String },
    Ready(u32),
    Finish(String),
    Requeue { id: String, delay_ms: u32 },
    Touch(String),
    Nop,
    Pub { topic: String, body: Vec<u8> },
    Mpub { topic: String, bodies: Vec<Vec<u8>> },
    Dpub { topic: String, delay_ms: u32, body: Vec<u8> },
    Auth(Vec<u8>),
    Cls,
}

impl Command {
    pub fn identify(json: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(Self::Identify(serde_json::to_vec(json)?))
    }

    pub fn sub(topic: &str, channel: &str) -> Result<Self, ProtocolError> {
        valid_topic_name(topic)?;
        valid_channel_name(channel)?;
        Ok(Self::Sub { topic: topic.to_owned(), channel: channel.to_owned() })
    }

    pub fn pub_(topic: &str, body: Vec<u8>) -> Result<Self, ProtocolError> {
        valid_topic_name(topic)?;
        Ok(Self::Pub { topic: topic.to_owned(), body })
    }

    pub fn mpub(topic: &str, bodies: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        valid_topic_name(topic)?;
        Ok(Self::Mpub { topic: topic.to_owned(), bodies })
    }

    pub fn dpub(topic: &str, delay_ms: u32, body: Vec<u8>) -> Result<Self, ProtocolError> {
        valid_topic_name(topic)?;
        Ok(Self::Dpub { topic: topic.to_owned(), delay_ms, body })
    }

    /// Serializes this command to `w`. The caller is responsible for
    /// prefixing the NSQ magic (`"  V2"`) once per connection, not once per
    /// command.
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        match self {
            Self::Identify(body) => write_command(&mut w, "IDENTIFY", &[], Some(body)),
            Self::Sub { topic, channel } => {
                write_command(&mut w, "SUB", &[topic, channel], None)
            }
            Self::Ready(count) => {
                let count = count.to_string();
                write_command(&mut w, "RDY", &[&count], None)
            }
            Self::Finish(id) => write_command(&mut w, "FIN", &[id], None),
            Self::Requeue { id, delay_ms } => {
                let delay = delay_ms.to_string();
                write_command(&mut w, "REQ", &[id, &delay], None)
            }
            Self::Touch(id) => write_command(&mut w, "TOUCH", &[id], None),
            Self::Nop => write_command(&mut w, "NOP", &[], None),
            Self::Pub { topic, body } => write_command(&mut w, "PUB", &[topic], Some(body)),
            Self::Mpub { topic, bodies } => {
                let mut body = Vec::with_capacity(4 + bodies.iter().map(|m| 4 + m.len()).sum::<usize>());
                body.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
                for m in bodies {
                    body.extend_from_slice(&(m.len() as u32).to_be_bytes());
                    body.extend_from_slice(m);
                }
                write_command(&mut w, "MPUB", &[topic], Some(&body))
            }
            Self::Dpub { topic, delay_ms, body } => {
                let delay = delay_ms.to_string();
                write_command(&mut w, "DPUB", &[topic, &delay], Some(body))
            }
            Self::Auth(body) => write_command(&mut w, "AUTH", &[], Some(body)),
            Self::Cls => write_command(&mut w, "CLS", &[], None),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf).expect("writing to a Vec<u8> cannot fail");
        buf
    }
}

fn write_command<W: Write>(
    w: &mut W,
    name: &str,
    params: &[&str],
    body: Option<&[u8]>,
) -> io::Result<()> {
    w.write_all(name.as_bytes())?;
    for p in params {
        w.write_all(b" ")?;
        w.write_all(p.as_bytes())?;
    }
    w.write_all(b"\n")?;
    if let Some(body) = body {
        w.write_all(&(body.len() as u32).to_be_bytes())?;
        w.write_all(body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_matches_wire_format() {
        let cmd = Command::sub("orders", "worker").unwrap();
        assert_eq!(cmd.to_bytes(), b"SUB orders worker\n");
    }

    #[test]
    fn ready_matches_wire_format() {
        assert_eq!(Command::Ready(50).to_bytes(), b"RDY 50\n");
    }

    #[test]
    fn finish_matches_wire_format() {
        assert_eq!(Command::Finish("abc123".into()).to_bytes(), b"FIN abc123\n");
    }

    #[test]
    fn requeue_matches_wire_format() {
        let cmd = Command::Requeue { id: "abc123".into(), delay_ms: 0 };
        assert_eq!(cmd.to_bytes(), b"REQ abc123 0\n");
    }

    #[test]
    fn pub_prefixes_body_length() {
        let cmd = Command::pub_("orders", b"hello".to_vec()).unwrap();
        let mut expected = b"PUB orders\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(cmd.to_bytes(), expected);
    }

    #[test]
    fn mpub_packs_count_and_each_message() {
        let cmd = Command::mpub("orders", vec![b"a".to_vec(), b"bb".to_vec()]).unwrap();
        let mut expected_body = Vec::new();
        expected_body.extend_from_slice(&2u32.to_be_bytes());
        expected_body.extend_from_slice(&1u32.to_be_bytes());
        expected_body.extend_from_slice(b"a");
        expected_body.extend_from_slice(&2u32.to_be_bytes());
        expected_body.extend_from_slice(b"bb");

        let mut expected = b"MPUB orders\n".to_vec();
        expected.extend_from_slice(&(expected_body.len() as u32).to_be_bytes());
        expected.extend_from_slice(&expected_body);
        assert_eq!(cmd.to_bytes(), expected);
    }

    #[test]
    fn rejects_invalid_topic() {
        assert!(Command::sub("bad topic", "worker").is_err());
    }
}
