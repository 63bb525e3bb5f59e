use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A held named lock. Only the holder's token can refresh or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: String,
    pub token: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock. `None` when another holder has an unexpired lease.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lock>>;

    /// Extend the lease by its full ttl. Returns false if the lease was lost.
    async fn refresh(&self, lock: &Lock) -> Result<bool>;

    async fn release(&self, lock: &Lock) -> Result<()>;
}
