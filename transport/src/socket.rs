//! Per-descriptor connection records and their completion slots.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::event_loop::LoopShared;
use crate::fd::FdHandle;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::pipe::{PipeConsumer, PipeProducer};
use crate::sys;

/// Epoll user-data bit marking a write-readiness arm (an event on the
/// dup descriptor). The registry key occupies the low 31 bits.
pub(crate) const WRITE_ARM: u32 = 1 << 31;

pub(crate) mod flags {
    pub const TYPE_ACCEPT: u32 = 1 << 0;
    pub const TYPE_CLIENT: u32 = 1 << 1;
    pub const TYPE_PIPE: u32 = 1 << 2;
    pub const DEFER_ACCEPT: u32 = 1 << 3;
    pub const EPOLL_REGISTERED: u32 = 1 << 4;
    pub const SHUTDOWN_SEND: u32 = 1 << 5;
    pub const SHUTDOWN_RECEIVE: u32 = 1 << 6;
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Direction {
    Send,
    Receive,
}

/// One tracked descriptor: a listener, a client connection, or the
/// self-pipe read end.
pub(crate) struct TrackedSocket {
    key: u32,
    fd: FdHandle,
    /// Created on the first writable arm; registered under
    /// `key | WRITE_ARM` so read and write interest stay independent.
    dup: Mutex<Option<FdHandle>>,
    flags: AtomicU32,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    pub(crate) readable: WaitSlot,
    pub(crate) writable: WaitSlot,
    /// Retained for shutdown-time cancellation of pending pipe waits.
    pipes: Mutex<Option<(PipeProducer, PipeConsumer)>>,
}

impl TrackedSocket {
    fn new(fd: FdHandle, initial_flags: u32, peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Arc<TrackedSocket> {
        Arc::new(TrackedSocket {
            key: fd.key(),
            fd,
            dup: Mutex::new(None),
            flags: AtomicU32::new(initial_flags),
            peer,
            local,
            readable: WaitSlot::new(),
            writable: WaitSlot::new(),
            pipes: Mutex::new(None),
        })
    }

    pub fn listener(fd: FdHandle, local: Option<SocketAddr>, defer_accept: bool) -> Arc<TrackedSocket> {
        let mut f = flags::TYPE_ACCEPT;
        if defer_accept {
            f |= flags::DEFER_ACCEPT;
        }
        TrackedSocket::new(fd, f, None, local)
    }

    pub fn client(
        fd: FdHandle,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        defer_accept: bool,
    ) -> Arc<TrackedSocket> {
        let mut f = flags::TYPE_CLIENT;
        if defer_accept {
            f |= flags::DEFER_ACCEPT;
        }
        TrackedSocket::new(fd, f, Some(peer), local)
    }

    pub fn pipe_end(fd: FdHandle) -> Arc<TrackedSocket> {
        TrackedSocket::new(fd, flags::TYPE_PIPE, None, None)
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn fd(&self) -> &FdHandle {
        &self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_pipes(&self, input: PipeProducer, output: PipeConsumer) {
        *self.pipes.lock() = Some((input, output));
    }

    pub fn pipes(&self) -> Option<(PipeProducer, PipeConsumer)> {
        self.pipes.lock().clone()
    }

    /// Merge one direction's teardown into the socket's lifetime.
    ///
    /// The send and receive tasks each call this exactly once, in either
    /// order. The first caller half-closes the socket so the peer
    /// observes it; the second removes the registry entry and closes
    /// both descriptors. The fd guard held across the flag merge keeps
    /// `shutdown` off a closed descriptor.
    pub fn cleanup(&self, shared: &LoopShared, direction: Direction) {
        let guard = self.fd.acquire();
        let (mine, other, how) = match direction {
            Direction::Send => (flags::SHUTDOWN_SEND, flags::SHUTDOWN_RECEIVE, libc::SHUT_WR),
            Direction::Receive => (flags::SHUTDOWN_RECEIVE, flags::SHUTDOWN_SEND, libc::SHUT_RD),
        };
        let prev = self.flags.fetch_or(mine, Ordering::AcqRel);
        if prev & mine != 0 {
            return;
        }
        if prev & other != 0 {
            shared.registry.remove(self.key);
            drop(guard);
            self.fd.close();
            if let Some(dup) = self.dup.lock().take() {
                dup.close();
            }
            CONNECTIONS_ACTIVE.decrement();
        } else {
            if let Some(g) = &guard {
                let _ = sys::shutdown(g.fd(), how);
            }
            drop(guard);
        }
    }

    /// Fail every current and future readable/writable wait.
    pub fn stop_waiters(&self) {
        self.readable.complete_stop();
        self.writable.complete_stop();
    }

    /// Close without ceremony (listener teardown, rejected accepts).
    pub fn dispose(&self) {
        self.fd.close();
        if let Some(dup) = self.dup.lock().take() {
            dup.close();
        }
    }
}

enum SlotState {
    Idle,
    Waiting(Waker),
    Ready,
    Stopped,
}

/// One-shot completion slot: a waker plus a "stopping" outcome. The loop
/// completes it; the owning task consumes it and re-arms for the next
/// wait. `Stopped` is sticky so waits after shutdown resolve to `false`
/// forever.
pub(crate) struct WaitSlot {
    state: Mutex<SlotState>,
}

impl WaitSlot {
    pub fn new() -> WaitSlot {
        WaitSlot {
            state: Mutex::new(SlotState::Idle),
        }
    }

    /// Record a delivered event and wake the waiter, if any.
    pub fn complete(&self) {
        let waker = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Ready) {
                SlotState::Stopped => {
                    *state = SlotState::Stopped;
                    None
                }
                SlotState::Waiting(waker) => Some(waker),
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Mark the slot stopped and wake the waiter, if any.
    pub fn complete_stop(&self) {
        let waker = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Stopped) {
                SlotState::Waiting(waker) => Some(waker),
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns `true` when the event fired, `false` when the loop is
    /// stopping.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<bool> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Ready => {
                *state = SlotState::Idle;
                Poll::Ready(true)
            }
            SlotState::Stopped => Poll::Ready(false),
            _ => {
                *state = SlotState::Waiting(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Drop a registered waiter after a failed arm.
    pub fn clear_waiter(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting(_)) {
            *state = SlotState::Idle;
        }
    }
}

/// Wait until the primary descriptor is readable. One-shot: each wait
/// re-arms epoll (ADD on first use, MOD after).
pub(crate) fn wait_readable(shared: &Arc<LoopShared>, ts: &Arc<TrackedSocket>) -> WaitReadable {
    WaitReadable {
        shared: shared.clone(),
        ts: ts.clone(),
        armed: false,
    }
}

pub(crate) struct WaitReadable {
    shared: Arc<LoopShared>,
    ts: Arc<TrackedSocket>,
    armed: bool,
}

impl Future for WaitReadable {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match self.ts.readable.poll_wait(cx) {
            Poll::Ready(v) => Poll::Ready(v),
            Poll::Pending => {
                if !self.armed {
                    self.armed = true;
                    if arm_read(&self.shared, &self.ts).is_err() {
                        self.ts.readable.clear_waiter();
                        return Poll::Ready(false);
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Wait until the dup descriptor reports writability. With `arm = false`
/// this only waits on the slot (the coalesce drain completes it).
pub(crate) fn wait_writable(
    shared: &Arc<LoopShared>,
    ts: &Arc<TrackedSocket>,
    arm: bool,
) -> WaitWritable {
    WaitWritable {
        shared: shared.clone(),
        ts: ts.clone(),
        arm,
        armed: false,
    }
}

pub(crate) struct WaitWritable {
    shared: Arc<LoopShared>,
    ts: Arc<TrackedSocket>,
    arm: bool,
    armed: bool,
}

impl Future for WaitWritable {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match self.ts.writable.poll_wait(cx) {
            Poll::Ready(v) => Poll::Ready(v),
            Poll::Pending => {
                if self.arm && !self.armed {
                    self.armed = true;
                    if arm_write(&self.shared, &self.ts).is_err() {
                        self.ts.writable.clear_waiter();
                        return Poll::Ready(false);
                    }
                }
                Poll::Pending
            }
        }
    }
}

fn arm_read(shared: &LoopShared, ts: &TrackedSocket) -> Result<(), ()> {
    if shared.is_stopping() {
        return Err(());
    }
    let ep = shared.epoll.acquire().ok_or(())?;
    let guard = ts.fd.acquire().ok_or(())?;
    let events = (libc::EPOLLIN | libc::EPOLLONESHOT) as u32;
    let first = ts.flags.fetch_or(flags::EPOLL_REGISTERED, Ordering::AcqRel)
        & flags::EPOLL_REGISTERED
        == 0;
    let result = if first {
        sys::epoll_add(ep.fd(), guard.fd(), events, ts.key)
    } else {
        sys::epoll_mod(ep.fd(), guard.fd(), events, ts.key)
    };
    result.map_err(|_| ())
}

fn arm_write(shared: &LoopShared, ts: &TrackedSocket) -> Result<(), ()> {
    if shared.is_stopping() {
        return Err(());
    }
    let ep = shared.epoll.acquire().ok_or(())?;
    let events = (libc::EPOLLOUT | libc::EPOLLONESHOT) as u32;
    let mut dup = ts.dup.lock();
    match &*dup {
        Some(handle) => {
            let guard = handle.acquire().ok_or(())?;
            sys::epoll_mod(ep.fd(), guard.fd(), events, ts.key | WRITE_ARM).map_err(|_| ())
        }
        None => {
            let guard = ts.fd.acquire().ok_or(())?;
            let raw = sys::dup(guard.fd()).map_err(|_| ())?;
            if sys::epoll_add(ep.fd(), raw, events, ts.key | WRITE_ARM).is_err() {
                sys::close(raw);
                return Err(());
            }
            *dup = Some(FdHandle::new(raw));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Flag(AtomicBool);

    impl std::task::Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn cx_pair() -> (Arc<Flag>, Waker) {
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        (flag, waker)
    }

    #[test]
    fn write_arm_bit_masks_back_to_key() {
        let key: u32 = 17;
        let data = key | WRITE_ARM;
        assert_eq!(data & !WRITE_ARM, key);
        assert_ne!(data, key);
    }

    #[test]
    fn slot_complete_before_wait() {
        let slot = WaitSlot::new();
        slot.complete();
        let (_, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(slot.poll_wait(&mut cx), Poll::Ready(true));
        // Consumed; the next wait parks again.
        assert!(slot.poll_wait(&mut cx).is_pending());
    }

    #[test]
    fn slot_wait_then_complete_wakes() {
        let slot = WaitSlot::new();
        let (flag, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        assert!(slot.poll_wait(&mut cx).is_pending());
        slot.complete();
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(slot.poll_wait(&mut cx), Poll::Ready(true));
    }

    #[test]
    fn slot_stop_is_sticky() {
        let slot = WaitSlot::new();
        slot.complete_stop();
        let (_, waker) = cx_pair();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(slot.poll_wait(&mut cx), Poll::Ready(false));
        slot.complete();
        assert_eq!(slot.poll_wait(&mut cx), Poll::Ready(false));
    }
}
