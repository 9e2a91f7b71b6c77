//! The per-connection send path.
//!
//! One logical task per connection reads from the application's output
//! pipe and writes to the socket: up to [`SEND_IOVS`] iovecs built on
//! the stack from the readable segments, one `writev` per iteration.
//! `EAGAIN` arms one-shot write interest on the connection's dup
//! descriptor. With write coalescing enabled, each iteration first hops
//! through the loop's coalesce queue so many senders complete in one
//! cycle.
//!
//! The read cursor is always advanced — possibly by zero — before the
//! next read, including on the error paths.

use std::io;
use std::sync::Arc;

use crate::config::SEND_IOVS;
use crate::event_loop::LoopShared;
use crate::metrics::BYTES_SENT;
use crate::pipe::PipeConsumer;
use crate::socket::{wait_writable, Direction, TrackedSocket};
use crate::sys;

pub(crate) async fn send_loop(
    shared: Arc<LoopShared>,
    ts: Arc<TrackedSocket>,
    output: PipeConsumer,
) {
    match run(&shared, &ts, &output).await {
        Ok(()) => output.complete(None),
        Err(e) => {
            tracing::debug!(key = ts.key(), error = %e, "send failed");
            output.complete(Some(e));
        }
    }
    ts.cleanup(&shared, Direction::Send);
}

async fn run(
    shared: &Arc<LoopShared>,
    ts: &Arc<TrackedSocket>,
    output: &PipeConsumer,
) -> io::Result<()> {
    loop {
        let mut view = output.read().await;

        if shared.coalesce_writes() {
            // Keep the snapshot unconsumed, park in the coalesce queue,
            // then take a fresh snapshot on the loop thread.
            output.advance(0);
            if !wait_coalesced(shared, ts).await {
                return Ok(());
            }
            view = output.read().await;
        }

        if view.is_cancelled() {
            return Ok(());
        }
        if view.is_empty() {
            if view.is_completed() {
                return Ok(());
            }
            output.advance(0);
            continue;
        }

        // Zero-length batches never reach writev.
        let wrote = {
            let mut iovs = [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; SEND_IOVS];
            let count = view.fill_iovecs(&mut iovs);
            match ts.fd().acquire() {
                Some(guard) => sys::writev(guard.fd(), &iovs[..count]),
                None => {
                    output.advance(0);
                    return Ok(());
                }
            }
        };

        match wrote {
            Ok(n) => {
                output.advance(n);
                BYTES_SENT.add(n as u64);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                output.advance(0);
                if !wait_writable(shared, ts, true).await {
                    return Ok(());
                }
            }
            Err(e) => {
                output.advance(0);
                return Err(e);
            }
        }
    }
}

/// Enqueue into the loop's coalesce queue and wait for the drain to
/// complete this socket's writable waiter.
async fn wait_coalesced(shared: &Arc<LoopShared>, ts: &Arc<TrackedSocket>) -> bool {
    shared.enqueue_coalesce(ts.clone());
    wait_writable(shared, ts, false).await
}
