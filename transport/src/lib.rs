//! penstock: a Linux-native, per-core TCP byte transport.
//!
//! Each [`Transport`] owns a dedicated OS thread running a private epoll
//! loop, a private pinned block pool, and its own listening and accepted
//! sockets. Accepted connections are bridged to the application through
//! a pair of byte-pipe halves with flow control; the loop moves bytes
//! between kernel sockets and those pipes with one vectored syscall per
//! readiness notification.

pub mod config;
pub mod error;
mod event_loop;
mod fd;
pub mod metrics;
pub mod pipe;
mod recv;
mod registry;
mod send;
mod socket;
mod sys;
mod task;
pub mod worker;

// Public API re-exports
pub use blockpool::{Block, BlockPool};
pub use config::{
    Config, ListenerOptions, WorkerConfig, BLOCK_SIZE, LISTEN_BACKLOG, MAX_SEND, RECV_IOVS,
    SEND_IOVS,
};
pub use error::Error;
pub use pipe::{FlushResult, Pipe, PipeConsumer, PipeProducer, ReadView, WriteRegion};
pub use worker::{Connection, ConnectionHandler, Endpoints, Transport, TransportSet};
