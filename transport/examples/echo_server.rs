//! Multi-core echo server.
//!
//! Usage: echo_server [addr]
//!
//! Launches one transport per CPU (sharing the port via SO_REUSEPORT)
//! and wires every accepted connection's input straight to its output.

use std::io;

use penstock::{Config, Connection, Endpoints, TransportSet, WorkerConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());
    let addr = bind_addr.parse().expect("invalid listen address");

    let config = Config {
        coalesce_writes: true,
        worker: WorkerConfig {
            threads: 0,
            pin_to_core: true,
            core_offset: 0,
        },
        ..Config::default()
    };

    let set = TransportSet::launch(config, |worker_id| {
        move |conn: &Connection| -> io::Result<Endpoints> {
            let (producer, consumer) = conn.pipe();
            tracing::info!(worker_id, peer = %conn.peer_addr(), "connection");
            Ok(Endpoints {
                input: producer,
                output: consumer,
            })
        }
    })
    .expect("failed to launch transports");

    let local = set.accept_on(addr).expect("failed to bind");
    eprintln!("echo server listening on {local} across {} loops", set.len());

    loop {
        std::thread::park();
    }
}
