use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RateLimitSettings;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens restored per second.
    pub rate: f64,
    /// Bucket capacity, and the size of a new client's first burst.
    pub burst: u32,
    /// Idle time after which a client's bucket is forgotten.
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
            ttl: Duration::from_secs(3 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            rate: settings.rps,
            burst: settings.burst,
            ttl: Duration::from_secs(settings.ttl_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
        }
    }
}

#[derive(Debug)]
struct Visitor {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Visitor {
    fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: u32, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-client token buckets.
///
/// Every registry mutation goes through a `DashMap` entry or `retain`, both of
/// which hold the shard's write lock, so creating a bucket and sweeping it can
/// never interleave for the same key.
pub struct RateLimiter {
    visitors: DashMap<IpAddr, Visitor>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            visitors: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn admit(&self, client: IpAddr) -> bool {
        self.admit_at(client, Instant::now())
    }

    fn admit_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut visitor = self
            .visitors
            .entry(client)
            .or_insert_with(|| Visitor::new(self.config.burst, now));

        visitor.last_seen = now;
        visitor.refill(self.config.rate, self.config.burst, now);
        visitor.try_take()
    }

    /// Drops buckets idle for longer than the configured TTL.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.visitors.retain(|_, visitor| {
            let keep = now.saturating_duration_since(visitor.last_seen) <= self.config.ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    /// Runs [`RateLimiter::sweep`] every `sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!("Rate limiter evicted {} idle clients, {} remain", removed, self.len());
                }
            }
        })
    }
}
