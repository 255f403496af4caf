use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use nsq_producer::{ProducerConfig, PublishError, Writer};

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

/// A published message against a real loopback fake nsqd: the connection
/// negotiates with a legacy `OK` IDENTIFY reply, then a `PUB` is answered
/// with `OK`, and the publish callback runs exactly once with success.
#[test]
fn publish_succeeds_once_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, nsq_protocol::MAGIC_V2);

        let (name, _) = read_command(&mut stream);
        assert!(name.starts_with("IDENTIFY"));
        write_response_frame(&mut stream, b"OK");

        let (name, body) = read_command(&mut stream);
        assert_eq!(name, "PUB orders");
        assert_eq!(body.unwrap(), b"hello");
        write_response_frame(&mut stream, b"OK");
    });

    let mut writer = Writer::new(ProducerConfig::new(vec![addr])).unwrap();

    let result: Arc<Mutex<Option<Result<(), PublishError>>>> = Arc::new(Mutex::new(None));

    // The connection hasn't finished negotiating when this test starts, so
    // the first few `pub_` attempts land synchronously as `NotConnected`;
    // keep retrying each tick until one actually queues against the
    // connected socket.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut in_flight = false;
    while Instant::now() < deadline && !server.is_finished() {
        writer.poll(Some(Duration::from_millis(20))).unwrap();

        if !in_flight {
            let cb = result.clone();
            writer.pub_("orders", b"hello".to_vec(), move |r| {
                *cb.lock().unwrap() = Some(r);
            });
            let not_connected = matches!(*result.lock().unwrap(), Some(Err(PublishError::NotConnected)));
            if not_connected {
                *result.lock().unwrap() = None;
            } else {
                in_flight = true;
            }
        } else if result.lock().unwrap().is_some() {
            break;
        }
    }

    server.join().unwrap();
    assert!(matches!(*result.lock().unwrap(), Some(Ok(()))));
}
