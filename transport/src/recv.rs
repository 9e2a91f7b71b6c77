//! The per-connection receive path.
//!
//! One logical task per connection alternates between a readability wait
//! and a single vectored receive into pool blocks. The readability wait
//! resumes on the loop thread, so the receive always runs there and may
//! use the loop's shared scratch: a cache of up to [`RECV_IOVS`] rented
//! blocks and a prematerialised iovec array. Blocks consumed by a
//! receive move into the application's input pipe (which then owns
//! them) and are replaced lazily on the next call.

use std::io;
use std::sync::Arc;

use blockpool::{Block, BlockPool};

use crate::config::RECV_IOVS;
use crate::event_loop::LoopShared;
use crate::metrics::BYTES_RECEIVED;
use crate::pipe::PipeProducer;
use crate::socket::{wait_readable, Direction, TrackedSocket};
use crate::socket::flags;
use crate::sys;

/// Per-loop receive scratch. Only ever touched from the loop thread; the
/// lock exists because the cache lives in shared loop state.
pub(crate) struct RecvScratch {
    blocks: Vec<Option<Block>>,
    iovs: [libc::iovec; RECV_IOVS],
}

// The iovec array holds pointers into pinned pool blocks.
unsafe impl Send for RecvScratch {}

impl RecvScratch {
    pub fn new() -> RecvScratch {
        RecvScratch {
            blocks: (0..RECV_IOVS).map(|_| None).collect(),
            iovs: [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; RECV_IOVS],
        }
    }

    /// Top up the cache and keep each iovec pointing at its block.
    fn refill(&mut self, pool: &BlockPool) -> io::Result<()> {
        for i in 0..RECV_IOVS {
            if self.blocks[i].is_none() {
                let block = pool.rent()?;
                self.iovs[i] = libc::iovec {
                    iov_base: block.as_ptr().cast(),
                    iov_len: block.len(),
                };
                self.blocks[i] = Some(block);
            }
        }
        Ok(())
    }

    fn iovs(&self) -> &[libc::iovec] {
        &self.iovs
    }

    /// Hand the first blocks covering `n` received bytes to the pipe.
    fn publish(&mut self, input: &PipeProducer, mut n: usize) {
        let mut i = 0;
        while n > 0 {
            let block = self.blocks[i].take().expect("receive past cached blocks");
            let take = n.min(block.len());
            input.write_block(block, take);
            n -= take;
            i += 1;
        }
    }

    /// Return all cached blocks to the pool.
    pub fn release_all(&mut self) {
        for slot in &mut self.blocks {
            *slot = None;
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Eof,
    WouldBlock,
}

pub(crate) async fn receive_loop(
    shared: Arc<LoopShared>,
    ts: Arc<TrackedSocket>,
    input: PipeProducer,
) {
    match run(&shared, &ts, &input).await {
        Ok(()) => input.complete(None),
        Err(e) => {
            tracing::debug!(key = ts.key(), error = %e, "receive failed");
            input.complete(Some(e));
        }
    }
    ts.cleanup(&shared, Direction::Receive);
}

async fn run(
    shared: &Arc<LoopShared>,
    ts: &Arc<TrackedSocket>,
    input: &PipeProducer,
) -> io::Result<()> {
    // With TCP_DEFER_ACCEPT the kernel only hands us sockets that have
    // data, so the first wait can be skipped.
    let mut known_readable = ts.has_flag(flags::DEFER_ACCEPT);
    loop {
        if !known_readable && !wait_readable(shared, ts).await {
            return Ok(());
        }
        known_readable = false;

        let outcome = {
            let mut scratch = shared.scratch.lock();
            scratch.refill(&shared.pool)?;
            let guard = match ts.fd().acquire() {
                Some(g) => g,
                None => return Ok(()),
            };
            match sys::readv(guard.fd(), scratch.iovs()) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    scratch.publish(input, n);
                    ReadOutcome::Data(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(e) => return Err(e),
            }
        };

        match outcome {
            ReadOutcome::Eof => return Ok(()),
            ReadOutcome::WouldBlock => continue,
            ReadOutcome::Data(n) => {
                BYTES_RECEIVED.add(n as u64);
                let flush = input.flush().await;
                if flush.is_completed || flush.is_cancelled {
                    return Ok(());
                }
                // The flush may have resumed us off-loop; the wait at the
                // top of the loop puts the next receive back on it.
            }
        }
    }
}
