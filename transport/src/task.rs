//! Cooperative task cells for the per-connection send and receive tasks.
//!
//! A task is a refcounted future. Waking it polls the future inline on
//! the waking thread: the loop wakes readable/writable/coalesce waiters
//! from the dispatch cycle, so those resumptions run on the loop thread;
//! pipe completions wake from whichever thread the application ran on,
//! and the task's next suspension is always a loop-owned waiter before
//! it touches loop state again.
//!
//! A wake that arrives while the task is mid-poll on another thread does
//! not block: it flags the task as notified and the polling thread loops
//! once more before releasing it. The same mechanism makes a wake from
//! inside the task's own `poll` (a self-wake) safe.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Waker};

use parking_lot::Mutex;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

pub(crate) struct Task {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
}

impl Task {
    /// Start a task, polling it to its first suspension point on the
    /// current thread.
    pub fn spawn<F>(future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(Task {
            state: AtomicU8::new(IDLE),
            future: Mutex::new(Some(Box::pin(future))),
        });
        task.run();
    }

    fn run(self: Arc<Self>) {
        // Claim the RUNNING state or hand a notification to the thread
        // that already holds it.
        loop {
            match self
                .state
                .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(RUNNING) => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                Err(NOTIFIED) | Err(DONE) => return,
                Err(_) => unreachable!("task state"),
            }
        }

        // Sole poller until we publish IDLE again; the future lock is
        // therefore uncontended.
        loop {
            let waker = Waker::from(self.clone());
            let mut cx = Context::from_waker(&waker);
            let ready = {
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(future) => {
                        let ready = future.as_mut().poll(&mut cx).is_ready();
                        if ready {
                            *slot = None;
                        }
                        ready
                    }
                    None => true,
                }
            };
            if ready {
                self.state.store(DONE, Ordering::Release);
                return;
            }
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(NOTIFIED) => {
                    self.state.store(RUNNING, Ordering::Release);
                }
                Err(_) => return,
            }
        }
    }
}

impl std::task::Wake for Task {
    fn wake(self: Arc<Self>) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;

    struct YieldOnce {
        yielded: bool,
    }

    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn self_wake_reruns_without_deadlock() {
        static STEPS: AtomicUsize = AtomicUsize::new(0);
        STEPS.store(0, Ordering::SeqCst);
        Task::spawn(async {
            STEPS.fetch_add(1, Ordering::SeqCst);
            YieldOnce { yielded: false }.await;
            STEPS.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(STEPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cross_thread_wake_resumes() {
        let (tx, rx) = crossbeam_channel::bounded::<Waker>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

        struct Park {
            tx: crossbeam_channel::Sender<Waker>,
            parked: bool,
        }
        impl Future for Park {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.parked {
                    Poll::Ready(())
                } else {
                    self.parked = true;
                    self.tx.send(cx.waker().clone()).unwrap();
                    Poll::Pending
                }
            }
        }

        Task::spawn(async move {
            Park { tx, parked: false }.await;
            done_tx.send(()).unwrap();
        });

        let waker = rx.recv().unwrap();
        let handle = std::thread::spawn(move || waker.wake());
        done_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        handle.join().unwrap();
    }
}
