#![allow(dead_code)]

use std::future::Future;
use std::io::{self, Read};
use std::net::TcpStream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::Thread;
use std::time::{Duration, Instant};

use penstock::{Connection, Endpoints};

struct Unpark(Thread);

impl std::task::Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

/// Drive a future on the current thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = Box::pin(future);
    let waker = Waker::from(Arc::new(Unpark(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::park_timeout(Duration::from_millis(100)),
        }
    }
}

/// Handler that wires each connection's input straight to its output.
pub fn echo(conn: &Connection) -> io::Result<Endpoints> {
    let (producer, consumer) = conn.pipe();
    Ok(Endpoints {
        input: producer,
        output: consumer,
    })
}

/// Poll `predicate` until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Read exactly `len` bytes, with a generous deadline.
pub fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// A deterministic byte pattern for ordering checks.
pub fn pattern_byte(offset: usize) -> u8 {
    (offset % 251) as u8
}
