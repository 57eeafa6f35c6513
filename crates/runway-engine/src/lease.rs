//! Cross-process run leases
//!
//! Prevents two workers from advancing the same run. Single-process mode
//! uses the no-op provider; distributed mode uses a key-scoped lease backed
//! by the shared store.

use async_trait::async_trait;

#[async_trait]
pub trait RunLease: Send + Sync + 'static {
    /// Attempt to acquire the lease for `key`. Returns false when another
    /// owner holds it.
    async fn acquire(&self, key: &str) -> bool;

    /// Refresh the lease for `key` if currently owned.
    async fn refresh(&self, key: &str) -> bool;

    /// Release the lease for `key` if currently owned.
    async fn release(&self, key: &str);
}

/// Lease provider for single-process mode.
pub struct NoopRunLease;

#[async_trait]
impl RunLease for NoopRunLease {
    async fn acquire(&self, _key: &str) -> bool {
        true
    }

    async fn refresh(&self, _key: &str) -> bool {
        true
    }

    async fn release(&self, _key: &str) {}
}
