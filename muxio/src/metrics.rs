//! Reactor metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups written to loop eventfds"
)]
pub static WAKEUPS: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Total timer callbacks dispatched")]
pub static TIMERS_FIRED: Counter = Counter::new();
