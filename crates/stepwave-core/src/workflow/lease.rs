//! Lease store port.
//!
//! Short-lived exclusive leases serialize the two wave-level decisions that
//! must not run concurrently for the same `(instance, wave)`: deciding that a
//! wave is complete, and inserting a wave's step entries. Leases carry an
//! expiry so a crashed holder cannot block progress forever.

use std::future::Future;
use std::time::Duration;

use stepwave_types::lease::LeaseKey;

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease store error: {0}")]
    Store(String),
}

/// Storage for exclusive, expiring leases.
pub trait LeaseStore: Send + Sync {
    /// Try to take the lease. Succeeds if nobody holds it or the current
    /// holder's lease has expired. Never blocks waiting for a holder.
    fn acquire(
        &self,
        key: &LeaseKey,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LeaseError>> + Send;

    /// Drop the lease. Releasing a lease that is not held is a no-op.
    fn release(&self, key: &LeaseKey) -> impl Future<Output = Result<(), LeaseError>> + Send;

    /// Delete every expired lease. Returns how many were removed.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, LeaseError>> + Send;
}
