use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio_rusqlite::{
    Connection,
    rusqlite::{self, params},
};
use uuid::Uuid;

use super::ts;
use crate::core::lock::{Lock, LockManager};

/// Named leases in the `locks` table. An expired lease can be taken over.
#[derive(Clone)]
pub struct SqliteLockManager {
    conn: Connection,
}

impl SqliteLockManager {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

fn expiry(ttl: Duration) -> String {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    ts(&Utc::now().checked_add_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC))
}

#[async_trait]
impl LockManager for SqliteLockManager {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lock>> {
        let lock = Lock {
            name: name.to_string(),
            token: Uuid::now_v7().to_string(),
            ttl,
        };
        let candidate = lock.clone();

        let acquired = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                tx.execute(
                    "DELETE FROM locks WHERE name = ?1 AND expires_at <= ?2",
                    params![&candidate.name, ts(&Utc::now())],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO locks (name, token, expires_at) VALUES (?1, ?2, ?3)",
                    params![&candidate.name, &candidate.token, expiry(candidate.ttl)],
                )?;
                tx.commit()?;
                Ok::<bool, rusqlite::Error>(inserted == 1)
            })
            .await
            .map_err(|e| anyhow!("Failed to acquire lock: {}", e))?;

        Ok(acquired.then_some(lock))
    }

    async fn refresh(&self, lock: &Lock) -> Result<bool> {
        let lock = lock.clone();
        self.conn
            .call(move |c| {
                let updated = c.execute(
                    "UPDATE locks SET expires_at = ?1 WHERE name = ?2 AND token = ?3",
                    params![expiry(lock.ttl), &lock.name, &lock.token],
                )?;
                Ok::<bool, rusqlite::Error>(updated == 1)
            })
            .await
            .map_err(|e| anyhow!("Failed to refresh lock: {}", e))
    }

    async fn release(&self, lock: &Lock) -> Result<()> {
        let lock = lock.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "DELETE FROM locks WHERE name = ?1 AND token = ?2",
                    params![&lock.name, &lock.token],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(|e| anyhow!("Failed to release lock: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let dir = tempdir().unwrap();
        let locks = SqliteLockManager::new(init(&dir.path().join("l.db")).await.unwrap());
        let ttl = Duration::from_secs(3600);

        let held = locks.acquire("run", ttl).await.unwrap().unwrap();
        assert!(locks.acquire("run", ttl).await.unwrap().is_none());
        assert!(locks.refresh(&held).await.unwrap());

        locks.release(&held).await.unwrap();
        assert!(!locks.refresh(&held).await.unwrap());
        assert!(locks.acquire("run", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let dir = tempdir().unwrap();
        let locks = SqliteLockManager::new(init(&dir.path().join("l.db")).await.unwrap());

        let stale = locks.acquire("run", Duration::ZERO).await.unwrap().unwrap();
        let fresh = locks
            .acquire("run", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(stale.token, fresh.token);
        assert!(!locks.refresh(&stale).await.unwrap());
    }
}
