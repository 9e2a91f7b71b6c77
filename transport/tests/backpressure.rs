//! A large application-driven send must survive kernel backpressure:
//! the socket buffer fills, the send path re-arms write interest, and
//! every byte still arrives exactly once and in order.

mod common;

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;

use penstock::{Config, Connection, Endpoints, Transport};

const TOTAL: usize = 4 * 1024 * 1024;
const CHUNK: usize = 4096;

fn blast(conn: &Connection) -> io::Result<Endpoints> {
    let (input, _input_reader) = conn.pipe();
    let (output_writer, output) = conn.pipe();

    std::thread::spawn(move || {
        let mut chunk = [0u8; CHUNK];
        let mut offset = 0usize;
        while offset < TOTAL {
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = common::pattern_byte(offset + i);
            }
            let mut region = match output_writer.alloc(CHUNK) {
                Ok(region) => region,
                Err(_) => break,
            };
            assert_eq!(region.put(&chunk), CHUNK);
            output_writer.commit(region);
            offset += CHUNK;

            let flush = common::block_on(output_writer.flush());
            if flush.is_completed || flush.is_cancelled {
                break;
            }
        }
        output_writer.complete(None);
    });

    Ok(Endpoints { input, output })
}

#[test]
fn four_mib_push_arrives_in_order() {
    let transport = Transport::new(Config::default(), blast);
    transport.start().unwrap();
    let addr = transport.accept_on("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    // Let the sender hit a full socket buffer before we start draining.
    std::thread::sleep(Duration::from_millis(200));

    client
        .set_read_timeout(Some(Duration::from_secs(60)))
        .unwrap();
    let mut received = 0usize;
    let mut buf = [0u8; 64 * 1024];
    while received < TOTAL {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed {} bytes early", TOTAL - received);
        for (i, &byte) in buf[..n].iter().enumerate() {
            assert_eq!(
                byte,
                common::pattern_byte(received + i),
                "byte {} out of order",
                received + i
            );
        }
        received += n;
    }
    assert_eq!(received, TOTAL);

    // The producer completed; the transport drains and closes its side.
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    transport.stop().unwrap();
}
