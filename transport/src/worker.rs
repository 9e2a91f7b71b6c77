//! The caller-facing lifecycle surface and per-core deployment.
//!
//! A [`Transport`] owns one event loop on a dedicated thread. Lifecycle
//! calls drive the state machine Initial → Starting → Started →
//! (ClosingAccept → AcceptClosed) → Stopping → Stopped; `close_accept`
//! and `stop` hand the loop a STATE_CHANGE byte over the self-pipe and
//! block on a completion installed under the gate mutex. Illegal call
//! orders fail with [`Error::InvalidState`].
//!
//! [`TransportSet`] launches one pinned transport per core and binds
//! them to a shared address with `SO_REUSEPORT`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use blockpool::BlockPool;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::event_loop::{EventLoop, Gate, LoopState};
use crate::fd::FdHandle;
use crate::pipe::{Pipe, PipeConsumer, PipeProducer};
use crate::socket::{flags, TrackedSocket};
use crate::sys;

/// What the loop hands the application for each accepted connection.
pub struct Connection {
    peer: SocketAddr,
    local: Option<SocketAddr>,
    pool: BlockPool,
    pause_threshold: usize,
    resume_threshold: usize,
}

impl Connection {
    pub(crate) fn new(
        peer: SocketAddr,
        local: Option<SocketAddr>,
        pool: BlockPool,
        pause_threshold: usize,
        resume_threshold: usize,
    ) -> Connection {
        Connection {
            peer,
            local,
            pool,
            pause_threshold,
            resume_threshold,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// The loop's block pool, for building pipes.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// A pipe using the loop's pool and flow-control thresholds.
    pub fn pipe(&self) -> (PipeProducer, PipeConsumer) {
        Pipe::new(
            self.pool.clone(),
            self.pause_threshold,
            self.resume_threshold,
        )
    }
}

/// The pipe halves the transport drives for one connection: received
/// bytes are produced into `input`; bytes to send are consumed from
/// `output`.
pub struct Endpoints {
    pub input: PipeProducer,
    pub output: PipeConsumer,
}

/// Application callback invoked on the loop thread immediately after
/// accept. Must return synchronously; an `Err` disposes the socket.
pub trait ConnectionHandler: Send + 'static {
    fn on_connection(&mut self, conn: &Connection) -> io::Result<Endpoints>;
}

impl<F> ConnectionHandler for F
where
    F: FnMut(&Connection) -> io::Result<Endpoints> + Send + 'static,
{
    fn on_connection(&mut self, conn: &Connection) -> io::Result<Endpoints> {
        self(conn)
    }
}

struct Runtime {
    handler: Option<Box<dyn ConnectionHandler>>,
    join: Option<thread::JoinHandle<()>>,
}

/// One event loop bound to one OS thread.
pub struct Transport {
    config: Config,
    gate: Arc<Mutex<Gate>>,
    runtime: Mutex<Runtime>,
}

impl Transport {
    pub fn new<H: ConnectionHandler>(config: Config, handler: H) -> Transport {
        Transport {
            config,
            gate: Arc::new(Mutex::new(Gate::new())),
            runtime: Mutex::new(Runtime {
                handler: Some(Box::new(handler)),
                join: None,
            }),
        }
    }

    /// Spawn the loop thread and wait for it to reach Started. Setup
    /// failures (epoll, self-pipe, affinity) are returned here.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut gate = self.gate.lock();
            if gate.state != LoopState::Initial {
                return Err(Error::InvalidState("transport already started"));
            }
            gate.state = LoopState::Starting;
        }
        let handler = self
            .runtime
            .lock()
            .handler
            .take()
            .expect("handler present in Initial state");

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let gate = self.gate.clone();
        let config = self.config.clone();
        let name = match config.cpu {
            Some(cpu) => format!("penstock-loop-{cpu}"),
            None => "penstock-loop".to_string(),
        };
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(config, gate, handler, ready_tx))
            .map_err(|e| Error::Setup(format!("spawn loop thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.runtime.lock().join = Some(join);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(Error::Setup("loop thread exited during startup".to_string()))
            }
        }
    }

    /// Bind a listener and register it with the loop. Returns the bound
    /// address, so `:0` requests report their ephemeral port.
    pub fn accept_on(&self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let gate = self.gate.lock();
        if gate.state != LoopState::Started {
            return Err(Error::InvalidState("accept_on requires a started transport"));
        }
        let shared = gate
            .shared
            .clone()
            .ok_or(Error::InvalidState("event loop is not available"))?;

        let opts = sys::ListenOptions {
            backlog: self.config.backlog,
            reuse_port: self.config.listener.reuse_port,
            defer_accept: self.config.listener.defer_accept,
            ipv6_only: self.config.listener.ipv6_only,
            incoming_cpu: self.config.cpu,
        };
        let fd = sys::tcp_listener(addr, &opts)?;
        let local = match sys::local_addr(fd) {
            Ok(local) => local,
            Err(e) => {
                sys::close(fd);
                return Err(e.into());
            }
        };

        let ts = TrackedSocket::listener(FdHandle::new(fd), Some(local), opts.defer_accept);
        shared.registry.insert(ts.clone());
        let armed = shared
            .epoll
            .acquire()
            .ok_or(Error::InvalidState("event loop is stopping"))
            .and_then(|ep| {
                sys::epoll_add(ep.fd(), fd, libc::EPOLLIN as u32, ts.key()).map_err(Error::Io)
            });
        if let Err(e) = armed {
            shared.registry.remove(ts.key());
            ts.dispose();
            return Err(e);
        }
        info!(%local, "listening");
        Ok(local)
    }

    /// Close every listener. Active connections continue. Blocks until
    /// the loop reports AcceptClosed.
    pub fn close_accept(&self) -> Result<(), Error> {
        let rx = {
            let mut gate = self.gate.lock();
            if gate.state != LoopState::Started {
                return Err(Error::InvalidState(
                    "close_accept requires a started transport",
                ));
            }
            gate.state = LoopState::ClosingAccept;
            let (tx, rx) = crossbeam_channel::bounded(1);
            gate.close_accept_done = Some(tx);
            rx
        };
        self.signal();
        rx.recv()
            .unwrap_or(Err(Error::InvalidState("event loop exited")))
    }

    /// Stop the loop: fail all waiters, drain the registry, close every
    /// descriptor. Blocks until the loop reports Stopped.
    pub fn stop(&self) -> Result<(), Error> {
        let rx = {
            let mut gate = self.gate.lock();
            match gate.state {
                LoopState::Started
                | LoopState::ClosingAccept
                | LoopState::AcceptClosed
                | LoopState::Stopping => {}
                _ => return Err(Error::InvalidState("stop requires a started transport")),
            }
            if gate.stop_done.is_some() {
                return Err(Error::InvalidState("stop already in progress"));
            }
            gate.state = LoopState::Stopping;
            let (tx, rx) = crossbeam_channel::bounded(1);
            gate.stop_done = Some(tx);
            rx
        };
        self.signal();
        let result = rx
            .recv()
            .unwrap_or(Err(Error::InvalidState("event loop exited")));
        if let Some(join) = self.runtime.lock().join.take() {
            let _ = join.join();
        }
        result
    }

    /// Number of tracked client connections.
    pub fn connections(&self) -> usize {
        match self.gate.lock().shared.as_ref() {
            Some(shared) => shared
                .registry
                .snapshot()
                .iter()
                .filter(|ts| ts.has_flag(flags::TYPE_CLIENT))
                .count(),
            None => 0,
        }
    }

    fn signal(&self) {
        let shared = self.gate.lock().shared.clone();
        if let Some(shared) = shared {
            shared.signal_state_change();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let state = self.gate.lock().state;
        if matches!(
            state,
            LoopState::Started
                | LoopState::ClosingAccept
                | LoopState::AcceptClosed
                | LoopState::Stopping
        ) {
            if let Err(e) = self.stop() {
                warn!(error = %e, "stop on drop failed");
            }
        } else if let Some(join) = self.runtime.lock().join.take() {
            let _ = join.join();
        }
    }
}

fn run_loop(
    config: Config,
    gate: Arc<Mutex<Gate>>,
    handler: Box<dyn ConnectionHandler>,
    ready: crossbeam_channel::Sender<Result<(), Error>>,
) {
    if let Some(cpu) = config.cpu {
        if let Err(e) = sys::pin_to_cpu(cpu) {
            gate.lock().state = LoopState::Stopped;
            let _ = ready.send(Err(Error::Setup(format!(
                "sched_setaffinity(cpu {cpu}): {e}"
            ))));
            return;
        }
    }
    match EventLoop::setup(config, gate.clone(), handler) {
        Ok(mut event_loop) => {
            {
                let mut gate = gate.lock();
                gate.shared = Some(event_loop.shared());
                gate.state = LoopState::Started;
            }
            let _ = ready.send(Ok(()));
            event_loop.run();
        }
        Err(e) => {
            gate.lock().state = LoopState::Stopped;
            let _ = ready.send(Err(e));
        }
    }
}

/// One transport per core, sharing a listen address through
/// `SO_REUSEPORT`.
pub struct TransportSet {
    transports: Vec<Transport>,
}

impl TransportSet {
    /// Launch `config.worker.threads` transports (0 = one per CPU),
    /// pinned from `config.worker.core_offset` upward when
    /// `pin_to_core` is set. `factory` builds one handler per loop.
    pub fn launch<H, F>(config: Config, mut factory: F) -> Result<TransportSet, Error>
    where
        H: ConnectionHandler,
        F: FnMut(usize) -> H,
    {
        let count = if config.worker.threads == 0 {
            sys::num_cpus()
        } else {
            config.worker.threads
        };

        let mut transports = Vec::with_capacity(count);
        for worker_id in 0..count {
            let mut worker_config = config.clone();
            worker_config.cpu = if config.worker.pin_to_core {
                Some(config.worker.core_offset + worker_id)
            } else {
                None
            };
            if count > 1 {
                worker_config.listener.reuse_port = true;
            }
            let transport = Transport::new(worker_config, factory(worker_id));
            transport.start()?;
            transports.push(transport);
        }
        Ok(TransportSet { transports })
    }

    /// Bind every loop to the same address. A `:0` request binds the
    /// first loop to an ephemeral port and the rest to that port.
    pub fn accept_on(&self, addr: SocketAddr) -> Result<SocketAddr, Error> {
        let mut bound: Option<SocketAddr> = None;
        for transport in &self.transports {
            let local = transport.accept_on(bound.unwrap_or(addr))?;
            bound.get_or_insert(local);
        }
        bound.ok_or(Error::InvalidState("transport set is empty"))
    }

    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Stop every loop.
    pub fn stop(&self) -> Result<(), Error> {
        for transport in &self.transports {
            transport.stop()?;
        }
        Ok(())
    }
}
