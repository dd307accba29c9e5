//! Fire lease: only the holder may enqueue scheduled jobs.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use shoptrack_core::error::poisoned;
use shoptrack_core::PipelineResult;

/// Lease with expiry shared by scheduler instances.
pub trait SchedulerLease: Send + Sync {
    /// Acquire the lease for `holder`, or renew it if `holder` already owns it.
    fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: Duration) -> PipelineResult<bool>;

    /// Release the lease if `holder` owns it.
    fn release(&self, holder: &str) -> PipelineResult<()>;
}

#[derive(Debug, Clone)]
struct Held {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Process-local lease for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryLease {
    held: Mutex<Option<Held>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerLease for InMemoryLease {
    fn try_acquire(&self, holder: &str, now: DateTime<Utc>, ttl: Duration) -> PipelineResult<bool> {
        let mut held = self.held.lock().map_err(poisoned)?;
        let free = match held.as_ref() {
            None => true,
            Some(h) => h.holder == holder || h.expires_at <= now,
        };
        if free {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
            *held = Some(Held {
                holder: holder.to_string(),
                expires_at: now + ttl,
            });
        }
        Ok(free)
    }

    fn release(&self, holder: &str) -> PipelineResult<()> {
        let mut held = self.held.lock().map_err(poisoned)?;
        if held.as_ref().is_some_and(|h| h.holder == holder) {
            *held = None;
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_lease::RedisLease;

#[cfg(feature = "redis")]
mod redis_lease {
    use super::*;
    use shoptrack_core::PipelineError;
    use std::sync::Arc;

    const DEFAULT_LEASE_KEY: &str = "shoptrack:scheduler:lease";

    /// Renew only when we still own the key.
    const RENEW_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
    "#;

    const RELEASE_SCRIPT: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
    "#;

    /// Redis lease using `SET key holder NX PX ttl`.
    ///
    /// Expiry is enforced by Redis, so `now` is ignored here.
    #[derive(Debug, Clone)]
    pub struct RedisLease {
        client: Arc<redis::Client>,
        key: String,
    }

    fn redis_err(err: redis::RedisError) -> PipelineError {
        PipelineError::store(format!("redis: {err}"))
    }

    impl RedisLease {
        pub fn new(redis_url: impl AsRef<str>, key: Option<String>) -> PipelineResult<Self> {
            let client = redis::Client::open(redis_url.as_ref()).map_err(redis_err)?;
            Ok(Self {
                client: Arc::new(client),
                key: key.unwrap_or_else(|| DEFAULT_LEASE_KEY.to_string()),
            })
        }
    }

    impl SchedulerLease for RedisLease {
        fn try_acquire(&self, holder: &str, _now: DateTime<Utc>, ttl: Duration) -> PipelineResult<bool> {
            let mut conn = self.client.get_connection().map_err(redis_err)?;
            let ttl_ms = ttl.as_millis().max(1) as u64;

            let set: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(holder)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query(&mut conn)
                .map_err(redis_err)?;
            if set.is_some() {
                return Ok(true);
            }

            let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
                .key(&self.key)
                .arg(holder)
                .arg(ttl_ms)
                .invoke(&mut conn)
                .map_err(redis_err)?;
            Ok(renewed == 1)
        }

        fn release(&self, holder: &str) -> PipelineResult<()> {
            let mut conn = self.client.get_connection().map_err(redis_err)?;
            let _: i64 = redis::Script::new(RELEASE_SCRIPT)
                .key(&self.key)
                .arg(holder)
                .invoke(&mut conn)
                .map_err(redis_err)?;
            Ok(())
        }
    }
}
