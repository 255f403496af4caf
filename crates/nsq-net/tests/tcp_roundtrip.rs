use std::{
    io::{Read, Write},
    net::TcpListener,
    time::Duration,
};

use nsq_net::{PollEvent, TcpConnector};

/// Drives a real loopback socket pair through `TcpConnector` end to end:
/// connect, frame a write, read it back as a length-prefixed frame on the
/// peer, and write a reply that the connector reassembles.
#[test]
fn connect_write_and_receive_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut connector = TcpConnector::new().unwrap();
    let token = connector.connect(addr).unwrap();

    let (mut peer, _) = listener.accept().unwrap();
    peer.set_nonblocking(false).unwrap();

    let payload = b"IDENTIFY";
    let mut frame = Vec::new();
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    connector.write_or_enqueue(token, &frame);
    connector.poll_with(Some(Duration::from_millis(50)), |_| {}).unwrap();

    let mut received = vec![0u8; frame.len()];
    peer.read_exact(&mut received).unwrap();
    assert_eq!(received, frame);

    let reply_payload = b"OK";
    let mut reply = Vec::new();
    reply.extend_from_slice(&(reply_payload.len() as u32).to_be_bytes());
    reply.extend_from_slice(reply_payload);
    peer.write_all(&reply).unwrap();
    peer.flush().unwrap();

    let mut seen = Vec::new();
    for _ in 0..20 {
        connector
            .poll_with(Some(Duration::from_millis(50)), |event| {
                if let PollEvent::Frame { frame, .. } = event {
                    seen.push(frame.to_vec());
                }
            })
            .unwrap();
        if !seen.is_empty() {
            break;
        }
    }

    assert_eq!(seen, vec![reply_payload.to_vec()]);
}

#[test]
fn closing_a_connection_is_idempotent() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut connector = TcpConnector::new().unwrap();
    let token = connector.connect(addr).unwrap();
    let _ = listener.accept().unwrap();

    assert!(connector.is_connected(token));
    connector.close(token);
    assert!(!connector.is_connected(token));
    connector.close(token);
}
