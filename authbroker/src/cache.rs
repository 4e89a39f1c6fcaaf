//! TTL cache contract shared by C1 (the `cache` table) and C4 (usage-report memoization).

use async_trait::async_trait;

#[async_trait]
pub trait UsageCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    /// `expires_at_secs` is seconds since epoch.
    async fn set(&self, key: &str, value: &str, expires_at_secs: i64);
}
