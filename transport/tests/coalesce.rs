//! Write coalescing: senders park in the coalesce queue and complete in
//! batches, and the data path stays correct with the hop enabled.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use penstock::{metrics, Config, Transport};

fn coalescing_config() -> Config {
    Config {
        coalesce_writes: true,
        ..Config::default()
    }
}

#[test]
fn four_connections_echo_with_coalescing() {
    let batches_before = metrics::COALESCE_BATCHES.value();

    let transport = Transport::new(coalescing_config(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let payload: Vec<u8> = (0..8 * 1024).map(common::pattern_byte).collect();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let payload = payload.clone();
            std::thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                client.write_all(&payload).unwrap();
                let buf = common::read_exact_timeout(&mut client, payload.len()).unwrap();
                buf == payload
            })
        })
        .collect();

    for worker in workers {
        assert!(worker.join().unwrap(), "echoed bytes differ");
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        metrics::COALESCE_BATCHES.value() > batches_before
    }));

    transport.stop().unwrap();
}

#[test]
fn sequential_messages_with_coalescing() {
    let transport = Transport::new(coalescing_config(), common::echo);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    for round in 0..50u32 {
        let message = format!("coalesced-{round:03}");
        client.write_all(message.as_bytes()).unwrap();
        let buf = common::read_exact_timeout(&mut client, message.len()).unwrap();
        assert_eq!(buf, message.as_bytes());
    }

    transport.stop().unwrap();
}
