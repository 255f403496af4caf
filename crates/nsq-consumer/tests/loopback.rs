use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use nsq_consumer::{ConsumerConfig, Reader};

/// Reads one `<name>[ params...]\n[body]` command off a blocking stream,
/// returning the line (without the trailing newline) and the body if the
/// command carries one.
fn read_command(stream: &mut impl Read) -> (String, Option<Vec<u8>>) {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    let line = String::from_utf8(line).unwrap();
    let name = line.split(' ').next().unwrap();
    let has_body = matches!(name, "IDENTIFY" | "PUB" | "MPUB" | "DPUB" | "AUTH");
    if !has_body {
        return (line, None);
    }
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).unwrap();
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (line, Some(body))
}

fn write_response_frame(stream: &mut impl Write, payload: &[u8]) {
    let mut frame = Vec::new();
    frame.extend_from_slice(&(4 + payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&0i32.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).unwrap();
}

fn write_message_frame(stream: &mut impl Write, id: [u8; 16], body: &[u8]) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1i64.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&id);
    payload.extend_from_slice(body);

    let mut frame = Vec::new();
    frame.extend_from_slice(&(4 + payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&2i32.to_be_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).unwrap();
}

/// S1 — single connection, one delivered message, handler finishes it.
/// Drives a real loopback fake nsqd through the magic handshake, a legacy
/// `OK` IDENTIFY reply (skipping feature negotiation), SUB, the initial
/// `RDY 1`, one MESSAGE, and the resulting RDY-bump-then-FIN on the wire.
#[test]
fn single_message_success_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, nsq_protocol::MAGIC_V2);

        let (name, _body) = read_command(&mut stream);
        assert!(name.starts_with("IDENTIFY"));
        write_response_frame(&mut stream, b"OK");

        let (name, _) = read_command(&mut stream);
        assert_eq!(name, "SUB orders worker");

        let (name, _) = read_command(&mut stream);
        assert_eq!(name, "RDY 1");

        let id = [7u8; 16];
        write_message_frame(&mut stream, id, b"hello");

        let first = read_command(&mut stream).0;
        let second = read_command(&mut stream).0;
        assert_eq!(first, "RDY 5");
        assert_eq!(second, format!("FIN {}", hex(&id)));
    });

    let mut config = ConsumerConfig::new("orders", "worker");
    config.max_in_flight = 5;
    config.nsqd_endpoints.push(addr);

    let handled = Arc::new(Mutex::new(false));
    let flag = handled.clone();
    let mut reader = Reader::new(config, move |msg: &mut nsq_core::Message| {
        assert_eq!(msg.body(), b"hello");
        *flag.lock().unwrap() = true;
        true
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !server.is_finished() {
        reader.poll(Some(Duration::from_millis(20))).unwrap();
    }

    server.join().unwrap();
    assert!(*handled.lock().unwrap());
}

fn hex(id: &[u8; 16]) -> String {
    let mut s = String::with_capacity(32);
    for byte in id {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}
