//! End-to-end echo round trips over a live transport.

mod common;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use penstock::{Config, Transport};

#[test]
fn five_byte_round_trip() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello").unwrap();
    let buf = common::read_exact_timeout(&mut client, 5).unwrap();
    assert_eq!(&buf, b"hello");

    // Half-close our send side; the transport drains the echo, then the
    // connection tears down and we observe EOF.
    client.shutdown(Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert!(common::wait_until(Duration::from_secs(5), || {
        transport.connections() == 0
    }));
    transport.stop().unwrap();
}

#[test]
fn sixty_four_kib_burst() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let payload: Vec<u8> = (0..64 * 1024).map(common::pattern_byte).collect();
    let mut client = TcpStream::connect(addr).unwrap();

    let mut reader = client.try_clone().unwrap();
    let expected = payload.clone();
    let read_side = std::thread::spawn(move || {
        common::read_exact_timeout(&mut reader, expected.len()).map(|buf| buf == expected)
    });

    client.write_all(&payload).unwrap();
    assert!(read_side.join().unwrap().unwrap(), "echoed bytes differ");

    transport.stop().unwrap();
}

#[test]
fn many_sequential_messages() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    for round in 0..100u32 {
        let message = format!("message-{round:04}");
        client.write_all(message.as_bytes()).unwrap();
        let buf = common::read_exact_timeout(&mut client, message.len()).unwrap();
        assert_eq!(buf, message.as_bytes());
    }

    transport.stop().unwrap();
}

#[test]
fn defer_accept_listener_echoes() {
    let config = Config {
        listener: penstock::ListenerOptions {
            defer_accept: true,
            ..Default::default()
        },
        ..Config::default()
    };
    let transport = Transport::new(config, common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    // With TCP_DEFER_ACCEPT the connection is only surfaced once data
    // arrives, and the first readability wait is skipped.
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"deferred").unwrap();
    let buf = common::read_exact_timeout(&mut client, 8).unwrap();
    assert_eq!(&buf, b"deferred");

    transport.stop().unwrap();
}

#[test]
fn two_clients_are_independent() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut a = TcpStream::connect(addr).unwrap();
    let mut b = TcpStream::connect(addr).unwrap();

    a.write_all(b"from-a").unwrap();
    b.write_all(b"from-b").unwrap();

    assert_eq!(common::read_exact_timeout(&mut b, 6).unwrap(), b"from-b");
    assert_eq!(common::read_exact_timeout(&mut a, 6).unwrap(), b"from-a");

    assert!(common::wait_until(Duration::from_secs(5), || {
        transport.connections() == 2
    }));
    transport.stop().unwrap();
    assert_eq!(transport.connections(), 0);
}
