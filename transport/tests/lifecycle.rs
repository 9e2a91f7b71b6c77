//! Lifecycle state machine: listener close, stop with live traffic, and
//! illegal call orders.

mod common;

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use penstock::{Config, Error, Transport};

#[test]
fn close_accept_keeps_active_clients() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut clients: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(addr).unwrap())
        .collect();
    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(format!("warm-{i}").as_bytes()).unwrap();
        let buf = common::read_exact_timeout(client, 6).unwrap();
        assert_eq!(buf, format!("warm-{i}").as_bytes());
    }

    transport.close_accept().unwrap();

    // The listener is gone...
    assert!(TcpStream::connect(addr).is_err());

    // ...but established connections keep exchanging bytes.
    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(format!("live-{i}").as_bytes()).unwrap();
        let buf = common::read_exact_timeout(client, 6).unwrap();
        assert_eq!(buf, format!("live-{i}").as_bytes());
    }

    transport.stop().unwrap();
}

#[test]
fn stop_during_inflight_upload() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let uploader = std::thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        let chunk = [0x5au8; 4096];
        // Push until the transport goes away. We never read, so flow
        // control keeps the connection mid-transfer the whole time.
        loop {
            if client.write_all(&chunk).is_err() {
                break;
            }
        }
    });

    assert!(common::wait_until(Duration::from_secs(5), || {
        transport.connections() == 1
    }));
    std::thread::sleep(Duration::from_millis(100));

    transport.stop().unwrap();
    assert_eq!(transport.connections(), 0);
    uploader.join().unwrap();
}

#[test]
fn illegal_call_orders() {
    let transport = Transport::new(Config::default(), common::echo);

    // Nothing is legal before start except start itself.
    assert!(matches!(
        transport.accept_on("127.0.0.1:0".parse().unwrap()),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        transport.close_accept(),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(transport.stop(), Err(Error::InvalidState(_))));

    transport.start().unwrap();
    assert!(matches!(transport.start(), Err(Error::InvalidState(_))));

    transport.close_accept().unwrap();
    // Accept is closed; both repeats are invalid now.
    assert!(matches!(
        transport.close_accept(),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        transport.accept_on("127.0.0.1:0".parse().unwrap()),
        Err(Error::InvalidState(_))
    ));

    transport.stop().unwrap();
    assert!(matches!(transport.stop(), Err(Error::InvalidState(_))));
}

#[test]
fn stop_without_listeners() {
    let transport = Transport::new(Config::default(), common::echo);
    transport.start().unwrap();
    transport.stop().unwrap();
}

#[test]
fn rejected_connection_is_disposed() {
    let handler = |_conn: &penstock::Connection| -> std::io::Result<penstock::Endpoints> {
        Err(std::io::Error::other("not today"))
    };
    let transport = Transport::new(Config::default(), handler);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    // The socket is closed without ceremony; we observe EOF or a reset.
    let mut buf = [0u8; 8];
    match client.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from a rejected connection"),
        Err(e) => assert!(matches!(
            e.kind(),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        )),
    }
    assert_eq!(transport.connections(), 0);

    transport.stop().unwrap();
}
