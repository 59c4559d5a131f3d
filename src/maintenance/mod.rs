//! Periodic housekeeping
//!
//! A [`MaintenanceScheduler`] drives a node's cycle: sweeping expired
//! requests and relay records, pruning routes, re-announcing the routing
//! table behind a [`DebounceGate`], and replaying queued sends.

mod debounce;
mod scheduler;

pub use debounce::{DebounceGate, DEFAULT_ANNOUNCE_DEBOUNCE};
pub use scheduler::{
    CycleFuture, Maintainable, MaintenanceHandle, MaintenanceScheduler, MaintenanceStats,
    TickOutcome, DEFAULT_MAINTENANCE_INTERVAL,
};
