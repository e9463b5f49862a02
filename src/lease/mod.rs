//! Leases on blobs and containers: the state machine the service applies and
//! the client-side handle that drives it.

mod client;
mod state;

pub use client::{Lease, LeaseClient};
pub use state::{
    LeasePeriod, LeaseRecord, LeaseScope, MAX_BREAK_SECONDS, MAX_LEASE_SECONDS,
    MIN_LEASE_SECONDS,
};
