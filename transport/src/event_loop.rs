//! The per-thread dispatch cycle.
//!
//! One loop owns an epoll descriptor, a self-pipe for out-of-band
//! control, a socket registry, a block pool, and the receive scratch.
//! Client interest is armed one-shot and re-armed by whichever task
//! consumed the completion; listeners and the self-pipe read end stay
//! level-triggered. Epoll user data carries the registry key, with bit
//! 31 marking events from a connection's dup (write-readiness)
//! descriptor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blockpool::BlockPool;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::{Config, BLOCK_SIZE};
use crate::error::Error;
use crate::fd::FdHandle;
use crate::metrics::{
    COALESCE_BATCHES, CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, LOOP_FATAL_ERRORS,
};
use crate::recv::{receive_loop, RecvScratch};
use crate::registry::Registry;
use crate::send::send_loop;
use crate::socket::{flags, TrackedSocket, WRITE_ARM};
use crate::sys;
use crate::task::Task;
use crate::worker::{Connection, ConnectionHandler, Endpoints};

/// Events drained per `epoll_wait` call.
const EPOLL_EVENTS: usize = 512;

/// Self-pipe control bytes. Exactly one byte per logical event.
pub(crate) const MSG_STATE_CHANGE: u8 = 0x00;
pub(crate) const MSG_COALESCE: u8 = 0x01;

/// Lifecycle states, in transition order. The loop thread assigns
/// Started, AcceptClosed and Stopped; external callers assign
/// ClosingAccept and Stopping under the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LoopState {
    Initial,
    Starting,
    Started,
    ClosingAccept,
    AcceptClosed,
    Stopping,
    Stopped,
}

/// State machine plus the completion slots for in-flight lifecycle
/// calls, all under one mutex. The loop's shared state is published
/// here in the same critical section that assigns Started, so a caller
/// that observes Started always has the handle.
pub(crate) struct Gate {
    pub state: LoopState,
    pub shared: Option<Arc<LoopShared>>,
    pub close_accept_done: Option<Sender<Result<(), Error>>>,
    pub stop_done: Option<Sender<Result<(), Error>>>,
}

impl Gate {
    pub fn new() -> Gate {
        Gate {
            state: LoopState::Initial,
            shared: None,
            close_accept_done: None,
            stop_done: None,
        }
    }
}

/// Loop state reachable from off-loop code: tasks re-arm epoll through
/// it, senders enqueue coalesce entries, the lifecycle surface writes
/// control bytes.
pub(crate) struct LoopShared {
    pub epoll: FdHandle,
    pub pipe_w: FdHandle,
    pub registry: Registry,
    pub pool: BlockPool,
    pub scratch: Mutex<RecvScratch>,
    pub gate: Arc<Mutex<Gate>>,
    coalesce_tx: Sender<Arc<TrackedSocket>>,
    coalesce_rx: Receiver<Arc<TrackedSocket>>,
    coalesce_pending: AtomicBool,
    stopping: AtomicBool,
    coalesce_writes: bool,
}

impl LoopShared {
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn coalesce_writes(&self) -> bool {
        self.coalesce_writes
    }

    /// Queue a socket for the next coalesce drain. At most one COALESCE
    /// byte is written per batch: only the 0→1 transition of the
    /// pending flag wakes the loop.
    pub fn enqueue_coalesce(&self, ts: Arc<TrackedSocket>) {
        let _ = self.coalesce_tx.send(ts);
        if !self.coalesce_pending.swap(true, Ordering::AcqRel) {
            if let Some(guard) = self.pipe_w.acquire() {
                sys::write_byte(guard.fd(), MSG_COALESCE);
            }
        }
    }

    /// Wake the loop to re-evaluate the gate.
    pub fn signal_state_change(&self) {
        if let Some(guard) = self.pipe_w.acquire() {
            sys::write_byte(guard.fd(), MSG_STATE_CHANGE);
        }
    }
}

pub(crate) struct EventLoop {
    shared: Arc<LoopShared>,
    pipe_r: FdHandle,
    pipe_key: u32,
    handler: Box<dyn ConnectionHandler>,
    config: Config,
    running: bool,
    do_close_accept: bool,
}

impl EventLoop {
    pub fn setup(
        config: Config,
        gate: Arc<Mutex<Gate>>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<EventLoop, Error> {
        let epoll = FdHandle::new(
            sys::epoll_create().map_err(|e| Error::Setup(format!("epoll_create1: {e}")))?,
        );
        let (pipe_r_raw, pipe_w_raw) =
            sys::pipe().map_err(|e| Error::Setup(format!("pipe2: {e}")))?;
        let pipe_r = FdHandle::new(pipe_r_raw);
        let pipe_w = FdHandle::new(pipe_w_raw);
        let pool = BlockPool::new(BLOCK_SIZE, config.pool_blocks)
            .map_err(|e| Error::Setup(format!("block pool: {e}")))?;

        let (coalesce_tx, coalesce_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(LoopShared {
            epoll,
            pipe_w,
            registry: Registry::new(),
            pool,
            scratch: Mutex::new(RecvScratch::new()),
            gate,
            coalesce_tx,
            coalesce_rx,
            coalesce_pending: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            coalesce_writes: config.coalesce_writes,
        });

        // The self-pipe read end is tracked like any other socket and
        // stays level-triggered: unread control bytes re-fire.
        let pipe_socket = TrackedSocket::pipe_end(pipe_r.clone());
        let pipe_key = pipe_socket.key();
        shared.registry.insert(pipe_socket);
        {
            let ep = shared
                .epoll
                .acquire()
                .expect("epoll closed during setup");
            sys::epoll_add(ep.fd(), pipe_r_raw, libc::EPOLLIN as u32, pipe_key)
                .map_err(|e| Error::Setup(format!("epoll_ctl(self-pipe): {e}")))?;
        }

        Ok(EventLoop {
            shared,
            pipe_r,
            pipe_key,
            handler,
            config,
            running: true,
            do_close_accept: false,
        })
    }

    pub fn shared(&self) -> Arc<LoopShared> {
        self.shared.clone()
    }

    /// The dispatch cycle. Blocks the calling thread until the loop
    /// stops, then runs the shutdown sequence.
    pub fn run(&mut self) {
        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            EPOLL_EVENTS
        ];

        while self.running {
            let count = match self.wait(&mut events) {
                Ok(n) => n,
                Err(()) => break,
            };

            if self.shared.coalesce_pending.swap(false, Ordering::AcqRel) {
                self.drain_coalesce();
            }

            for event in &events[..count] {
                let data = event.u64 as u32;
                let key = data & !WRITE_ARM;
                let Some(ts) = self.shared.registry.get(key) else {
                    // A closed descriptor's event raced its removal.
                    continue;
                };
                if ts.has_flag(flags::TYPE_ACCEPT) {
                    if !self.do_close_accept {
                        self.handle_accept(&ts);
                    }
                } else if ts.has_flag(flags::TYPE_PIPE) {
                    self.handle_control();
                } else if data & WRITE_ARM != 0 {
                    ts.writable.complete();
                } else {
                    ts.readable.complete();
                }
            }

            if self.do_close_accept {
                self.do_close_accept = false;
                self.close_listeners();
            }
        }

        self.shutdown();
    }

    /// Block for events. `EINTR` retries silently; any other failure is
    /// loop-fatal.
    fn wait(&mut self, events: &mut [libc::epoll_event]) -> Result<usize, ()> {
        loop {
            let result = match self.shared.epoll.acquire() {
                Some(ep) => sys::epoll_wait(ep.fd(), events),
                None => return Err(()),
            };
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed; stopping transport");
                    LOOP_FATAL_ERRORS.increment();
                    self.enter_stopping();
                    return Err(());
                }
            }
        }
    }

    fn enter_stopping(&mut self) {
        let mut gate = self.shared.gate.lock();
        if gate.state < LoopState::Stopping {
            gate.state = LoopState::Stopping;
        }
        self.running = false;
    }

    /// Complete one batch of coalesced write waiters. The batch size is
    /// the queue length observed at drain time, never more.
    fn drain_coalesce(&mut self) {
        let count = self.shared.coalesce_rx.len();
        if count == 0 {
            return;
        }
        COALESCE_BATCHES.increment();
        trace!(count, "draining coalesced writes");
        for _ in 0..count {
            match self.shared.coalesce_rx.try_recv() {
                Ok(ts) => ts.writable.complete(),
                Err(_) => break,
            }
        }
    }

    /// One control byte per event; the pipe is level-triggered so the
    /// rest of the queue re-fires.
    fn handle_control(&mut self) {
        let byte = {
            let Some(guard) = self.pipe_r.acquire() else {
                return;
            };
            match sys::read_byte(guard.fd()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "self-pipe read failed");
                    None
                }
            }
        };
        match byte {
            Some(MSG_STATE_CHANGE) => self.evaluate_gate(),
            // COALESCE bytes only exist to interrupt epoll_wait; the
            // drain at the top of the cycle already ran.
            Some(_) | None => {}
        }
    }

    fn evaluate_gate(&mut self) {
        let state = self.shared.gate.lock().state;
        match state {
            LoopState::ClosingAccept => self.do_close_accept = true,
            LoopState::Stopping => self.running = false,
            _ => {}
        }
    }

    /// Accept at most one connection per readiness notification so the
    /// kernel's SO_REUSEPORT balancing across loops stays effective.
    /// The listener is level-triggered; a non-empty queue re-fires.
    fn handle_accept(&mut self, listener: &Arc<TrackedSocket>) {
        let accepted = {
            let Some(guard) = listener.fd().acquire() else {
                return;
            };
            match sys::accept(guard.fd()) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        };
        let Some((fd, peer)) = accepted else {
            return;
        };
        self.register_client(fd, peer, listener.has_flag(flags::DEFER_ACCEPT));
    }

    fn register_client(&mut self, fd: i32, peer: std::net::SocketAddr, defer_accept: bool) {
        if let Err(e) = sys::set_nodelay(fd) {
            debug!(error = %e, "TCP_NODELAY failed");
        }
        let local = sys::local_addr(fd).ok();
        let ts = TrackedSocket::client(FdHandle::new(fd), peer, local, defer_accept);

        let conn = Connection::new(
            peer,
            local,
            self.shared.pool.clone(),
            self.config.pause_threshold,
            self.config.resume_threshold,
        );
        match self.handler.on_connection(&conn) {
            Ok(Endpoints { input, output }) => {
                ts.set_pipes(input.clone(), output.clone());
                self.shared.registry.insert(ts.clone());
                CONNECTIONS_ACCEPTED.increment();
                CONNECTIONS_ACTIVE.increment();
                trace!(%peer, key = ts.key(), "connection accepted");
                Task::spawn(send_loop(self.shared.clone(), ts.clone(), output));
                Task::spawn(receive_loop(self.shared.clone(), ts, input));
            }
            Err(e) => {
                debug!(%peer, error = %e, "connection rejected by handler");
                ts.dispose();
            }
        }
    }

    /// Close every accept socket; active client connections continue.
    fn close_listeners(&mut self) {
        for ts in self.shared.registry.snapshot() {
            if ts.has_flag(flags::TYPE_ACCEPT) {
                self.shared.registry.remove(ts.key());
                ts.dispose();
            }
        }
        let done = {
            let mut gate = self.shared.gate.lock();
            // A stop may have landed since the close-accept byte; never
            // move the state backwards.
            if gate.state == LoopState::ClosingAccept {
                gate.state = LoopState::AcceptClosed;
            }
            gate.close_accept_done.take()
        };
        debug!("accept sockets closed");
        if let Some(tx) = done {
            let _ = tx.send(Ok(()));
        }
    }

    /// Tear the loop down: stop arming, fail every waiter, cancel
    /// pending pipe waits, wait for the per-connection tasks to drain
    /// the registry, then release the loop's own resources.
    fn shutdown(&mut self) {
        debug!("event loop stopping");
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.epoll.close();

        self.shared.registry.remove(self.pipe_key);

        for ts in self.shared.registry.snapshot() {
            if ts.has_flag(flags::TYPE_ACCEPT) {
                self.shared.registry.remove(ts.key());
                ts.dispose();
                continue;
            }
            if let Some((input, output)) = ts.pipes() {
                input.cancel_pending_flush();
                output.cancel_pending_read();
            }
            ts.stop_waiters();
        }

        // Each connection's two tasks run CleanupSocket on their way
        // out; the second of the pair removes the registry entry.
        let mut spins = 0u32;
        while self.shared.registry.len() > 0 {
            spins += 1;
            if spins % 16 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        self.pipe_r.close();
        self.shared.pipe_w.close();
        self.shared.scratch.lock().release_all();

        let (accept_done, stop_done) = {
            let mut gate = self.shared.gate.lock();
            gate.state = LoopState::Stopped;
            // Drop the gate's back-reference so the loop state (and its
            // pool) can be freed once the last task lets go.
            gate.shared = None;
            (gate.close_accept_done.take(), gate.stop_done.take())
        };
        if let Some(tx) = accept_done {
            let _ = tx.send(Ok(()));
        }
        if let Some(tx) = stop_done {
            let _ = tx.send(Ok(()));
        }
        debug!("event loop stopped");
    }
}
