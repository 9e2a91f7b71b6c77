//! Reference-counted descriptor handles.
//!
//! Every syscall on a descriptor runs inside an [`FdGuard`] bracket.
//! [`FdHandle::close`] marks the descriptor closed, waits for all
//! outstanding guards to drop, then closes it exactly once, so the kernel
//! can never reuse the fd number while a syscall on it is still in flight.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::sys;

struct FdInner {
    fd: RawFd,
    guards: AtomicU32,
    closed: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct FdHandle {
    inner: Arc<FdInner>,
}

impl FdHandle {
    pub fn new(fd: RawFd) -> FdHandle {
        FdHandle {
            inner: Arc::new(FdInner {
                fd,
                guards: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The raw descriptor, for use as a registry key only. Syscalls must
    /// go through [`FdHandle::acquire`].
    pub fn key(&self) -> u32 {
        self.inner.fd as u32
    }

    /// Enter a use bracket. Returns `None` once the handle is closed.
    pub fn acquire(&self) -> Option<FdGuard<'_>> {
        self.inner.guards.fetch_add(1, Ordering::Acquire);
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.guards.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(FdGuard { inner: &self.inner })
    }

    /// Close the descriptor. Waits for in-flight guards to drain; only
    /// the first caller performs the `close`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut spins = 0u32;
        while self.inner.guards.load(Ordering::Acquire) != 0 {
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        sys::close(self.inner.fd);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for FdInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            sys::close(self.fd);
        }
    }
}

pub(crate) struct FdGuard<'a> {
    inner: &'a FdInner,
}

impl FdGuard<'_> {
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }
}

impl Drop for FdGuard<'_> {
    fn drop(&mut self) {
        self.inner.guards.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_fd() -> RawFd {
        let (r, w) = sys::pipe().unwrap();
        sys::close(w);
        r
    }

    #[test]
    fn acquire_after_close_fails() {
        let handle = FdHandle::new(scratch_fd());
        assert!(handle.acquire().is_some());
        handle.close();
        assert!(handle.acquire().is_none());
        assert!(handle.is_closed());
    }

    #[test]
    fn close_waits_for_guard() {
        let handle = FdHandle::new(scratch_fd());
        let other = handle.clone();
        let guard = handle.acquire().unwrap();
        let fd = guard.fd();

        let closer = std::thread::spawn(move || other.close());
        std::thread::sleep(std::time::Duration::from_millis(20));
        // The closer is parked on our guard; the fd must still be valid.
        assert!(fd >= 0);
        drop(guard);
        closer.join().unwrap();
        assert!(handle.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let handle = FdHandle::new(scratch_fd());
        handle.close();
        handle.close();
    }
}
