//! Transport metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently tracked client connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Total bytes read from client sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to client sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "coalesce_batches",
    description = "Write-readiness batches drained from the coalesce queue"
)]
pub static COALESCE_BATCHES: Counter = Counter::new();

#[metric(
    name = "loop_fatal_errors",
    description = "Event loop failures that forced a transport stop"
)]
pub static LOOP_FATAL_ERRORS: Counter = Counter::new();
