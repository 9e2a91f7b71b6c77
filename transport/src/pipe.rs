//! The byte-pipe bridging transport I/O to the application.
//!
//! A pipe is a producer/consumer pair over a list of pool-block
//! segments. The producer appends committed bytes — either copied
//! through a [`WriteRegion`] or zero-copy via [`PipeProducer::write_block`]
//! — and flushes with backpressure: a flush parks once the unread bytes
//! exceed the pause threshold and resumes when the consumer drains them
//! below the resume threshold. The consumer reads an owned segment view,
//! advances a byte cursor, and releases fully-consumed blocks back to
//! their pool.
//!
//! Both halves are cloneable handles onto shared state. Completion and
//! cancellation follow the usual one-shot rules: `complete` is sticky,
//! `cancel_pending_*` cancels the in-flight (or next) wait.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use blockpool::{Block, BlockPool};
use parking_lot::Mutex;

struct Shared {
    pool: BlockPool,
    pause_threshold: usize,
    resume_threshold: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    segments: VecDeque<(Block, u32, u32)>,
    readable: usize,
    read_waker: Option<Waker>,
    flush_waker: Option<Waker>,
    cancel_read: bool,
    cancel_flush: bool,
    writer_done: bool,
    writer_error: Option<(io::ErrorKind, String)>,
    reader_done: bool,
}

impl Inner {
    fn take_read_waker(&mut self) -> Option<Waker> {
        self.read_waker.take()
    }

    fn take_flush_waker(&mut self) -> Option<Waker> {
        self.flush_waker.take()
    }
}

/// Constructor namespace for a producer/consumer pair.
pub struct Pipe;

impl Pipe {
    /// Create a pipe whose segments come from `pool`.
    ///
    /// `pause_threshold` and `resume_threshold` bound the unread bytes a
    /// producer may buffer before its flush parks.
    pub fn new(
        pool: BlockPool,
        pause_threshold: usize,
        resume_threshold: usize,
    ) -> (PipeProducer, PipeConsumer) {
        let shared = Arc::new(Shared {
            pool,
            pause_threshold,
            resume_threshold,
            inner: Mutex::new(Inner {
                segments: VecDeque::new(),
                readable: 0,
                read_waker: None,
                flush_waker: None,
                cancel_read: false,
                cancel_flush: false,
                writer_done: false,
                writer_error: None,
                reader_done: false,
            }),
        });
        (
            PipeProducer {
                shared: shared.clone(),
            },
            PipeConsumer { shared },
        )
    }
}

/// Producer half: appends bytes, flushes with backpressure, completes.
#[derive(Clone)]
pub struct PipeProducer {
    shared: Arc<Shared>,
}

impl PipeProducer {
    /// Rent a writable region of at least `min` bytes (bounded by the
    /// pool block size). Fails once this half has been completed or the
    /// pool is exhausted.
    pub fn alloc(&self, min: usize) -> io::Result<WriteRegion> {
        assert!(
            min <= self.shared.pool.block_size(),
            "alloc larger than a pool block"
        );
        if self.shared.inner.lock().writer_done {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe producer completed",
            ));
        }
        let block = self.shared.pool.rent()?;
        Ok(WriteRegion { block, len: 0 })
    }

    /// Make the bytes written into `region` readable.
    pub fn commit(&self, region: WriteRegion) {
        if region.len > 0 {
            self.append(region.block, 0, region.len);
        }
    }

    /// Append the first `len` bytes of `block` without copying. The pipe
    /// owns the block reference until the consumer advances past it.
    pub fn write_block(&self, block: Block, len: usize) {
        assert!(len <= block.len(), "length exceeds block");
        if len > 0 {
            self.append(block, 0, len);
        }
    }

    fn append(&self, block: Block, start: usize, end: usize) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            if inner.reader_done {
                // Reader is gone; drop the bytes so the block recycles.
                return;
            }
            inner.segments.push_back((block, start as u32, end as u32));
            inner.readable += end - start;
            inner.take_read_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wait until the pipe is below its pause threshold (or the reader
    /// is done, or the flush is cancelled).
    pub fn flush(&self) -> Flush {
        Flush {
            shared: self.shared.clone(),
        }
    }

    /// Cancel the pending flush; if none is parked, the next flush
    /// observes the cancellation instead.
    pub fn cancel_pending_flush(&self) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            inner.cancel_flush = true;
            inner.take_flush_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Finish this half. A pending or future read on the consumer side
    /// observes completion (and `error`, if any) once the buffered bytes
    /// are drained.
    pub fn complete(&self, error: Option<io::Error>) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            inner.writer_done = true;
            if let Some(e) = error {
                inner.writer_error = Some((e.kind(), e.to_string()));
            }
            inner.take_read_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// A writable slice of one pool block, returned by [`PipeProducer::alloc`].
pub struct WriteRegion {
    block: Block,
    len: usize,
}

impl WriteRegion {
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    pub fn remaining(&self) -> usize {
        self.block.len() - self.len
    }

    pub fn written(&self) -> usize {
        self.len
    }

    /// Copy as much of `data` as fits; returns the bytes taken.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.block.write(self.len, &data[..take]);
        self.len += take;
        take
    }
}

/// Outcome of a flush wait.
#[derive(Debug, Clone, Copy)]
pub struct FlushResult {
    pub is_completed: bool,
    pub is_cancelled: bool,
}

pub struct Flush {
    shared: Arc<Shared>,
}

impl Future for Flush {
    type Output = FlushResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FlushResult> {
        let mut inner = self.shared.inner.lock();
        if inner.cancel_flush {
            inner.cancel_flush = false;
            return Poll::Ready(FlushResult {
                is_completed: inner.reader_done,
                is_cancelled: true,
            });
        }
        if inner.reader_done {
            return Poll::Ready(FlushResult {
                is_completed: true,
                is_cancelled: false,
            });
        }
        if inner.readable > self.shared.pause_threshold {
            inner.flush_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(FlushResult {
            is_completed: false,
            is_cancelled: false,
        })
    }
}

/// Consumer half: reads segment views, advances the byte cursor,
/// completes.
#[derive(Clone)]
pub struct PipeConsumer {
    shared: Arc<Shared>,
}

impl PipeConsumer {
    /// Wait for readable bytes, producer completion, or cancellation.
    pub fn read(&self) -> Read {
        Read {
            shared: self.shared.clone(),
        }
    }

    /// Consume `n` bytes from the front of the pipe. Fully-consumed
    /// blocks return to their pool; a parked flush resumes once the
    /// unread bytes drop to the resume threshold.
    pub fn advance(&self, n: usize) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            let mut left = n.min(inner.readable);
            inner.readable -= left;
            while left > 0 {
                let (_, start, end) = inner
                    .segments
                    .front_mut()
                    .expect("cursor ahead of segments");
                let avail = (*end - *start) as usize;
                if left >= avail {
                    left -= avail;
                    inner.segments.pop_front();
                } else {
                    *start += left as u32;
                    left = 0;
                }
            }
            if inner.readable <= self.shared.resume_threshold {
                inner.take_flush_waker()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Cancel the pending read; if none is parked, the next read
    /// observes the cancellation instead.
    pub fn cancel_pending_read(&self) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            inner.cancel_read = true;
            inner.take_read_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Finish this half. Buffered bytes are discarded (their blocks
    /// recycle) and a parked flush observes completion.
    pub fn complete(&self, _error: Option<io::Error>) {
        let waker = {
            let mut inner = self.shared.inner.lock();
            inner.reader_done = true;
            inner.segments.clear();
            inner.readable = 0;
            inner.take_flush_waker()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// The error the producer completed with, if any.
    pub fn producer_error(&self) -> Option<io::Error> {
        self.shared
            .inner
            .lock()
            .writer_error
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    /// Unread bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.inner.lock().readable
    }
}

pub struct Read {
    shared: Arc<Shared>,
}

impl Future for Read {
    type Output = ReadView;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ReadView> {
        let mut inner = self.shared.inner.lock();
        if inner.cancel_read {
            inner.cancel_read = false;
            return Poll::Ready(ReadView {
                segments: inner.segments.iter().cloned().collect(),
                completed: inner.writer_done,
                cancelled: true,
            });
        }
        if inner.readable > 0 || inner.writer_done {
            return Poll::Ready(ReadView {
                segments: inner.segments.iter().cloned().collect(),
                completed: inner.writer_done,
                cancelled: false,
            });
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// An owned snapshot of the pipe's readable segments. Blocks stay alive
/// (and their bytes stable) for as long as the view does.
pub struct ReadView {
    segments: Vec<(Block, u32, u32)>,
    completed: bool,
    cancelled: bool,
}

impl ReadView {
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|(_, s, e)| (e - s) as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|(_, s, e)| s == e)
    }

    /// The readable byte ranges, in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments
            .iter()
            .filter(|(_, s, e)| e > s)
            .map(|(block, s, e)| block.slice(*s as usize, *e as usize))
    }

    /// Gather into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Fill `iovs` from the view, skipping empty segments. Returns the
    /// number of entries populated.
    pub(crate) fn fill_iovecs(&self, iovs: &mut [libc::iovec]) -> usize {
        let mut count = 0;
        for (block, start, end) in &self.segments {
            if count == iovs.len() {
                break;
            }
            if end <= start {
                continue;
            }
            iovs[count] = libc::iovec {
                iov_base: unsafe { block.as_ptr().add(*start as usize) }.cast(),
                iov_len: (end - start) as usize,
            };
            count += 1;
        }
        count
    }
}
