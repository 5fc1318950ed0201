//! Worker registry.
//!
//! Live set of reachable workers with health and in-flight load. Workers
//! appear on first heartbeat and fall out after going quiet for longer
//! than the TTL. Acquisition picks the least loaded healthy workers,
//! breaking ties round-robin, and blocks up to the acquire timeout when
//! none are available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, warn};

use super::Error;

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: String,
    pub address: String,
    pub last_heartbeat: Instant,
    pub in_flight: usize,
    pub consecutive_failures: usize,
    pub healthy: bool,
}

/// A worker selected for one task.
#[derive(Debug, Clone)]
pub struct WorkerRef {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub acquire_timeout: Duration,
    pub worker_ttl: Duration,
    pub failure_threshold: usize,
}

pub struct Registry {
    inner: Mutex<Inner>,
    /// Signalled when a worker is released or (re)registered.
    available: Notify,
    config: RegistryConfig,
}

struct Inner {
    workers: HashMap<String, WorkerEntry>,
    round_robin: usize,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                workers: HashMap::new(),
                round_robin: 0,
            }),
            available: Notify::new(),
            config,
        }
    }

    /// Upsert a worker: first heartbeat creates it, later ones refresh it
    /// and clear any unhealthy mark.
    pub fn register(&self, worker_id: &str, address: &str) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();

            inner
                .workers
                .entry(worker_id.to_string())
                .and_modify(|entry| {
                    entry.address = address.to_string();
                    entry.last_heartbeat = now;
                    if !entry.healthy {
                        debug!("worker \"{}\" healthy again", worker_id);
                    }
                    entry.healthy = true;
                    entry.consecutive_failures = 0;
                })
                .or_insert_with(|| {
                    debug!("worker \"{}\" registered at {}", worker_id, address);
                    WorkerEntry {
                        id: worker_id.to_string(),
                        address: address.to_string(),
                        last_heartbeat: now,
                        in_flight: 0,
                        consecutive_failures: 0,
                        healthy: true,
                    }
                });
        }

        self.available.notify_waiters();
    }

    /// Refresh an existing worker: touch the heartbeat and clear an
    /// unhealthy mark, leaving the failure count alone. Returns false
    /// for unknown workers, which need a full registration.
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        let known = {
            let mut inner = self.inner.lock();
            match inner.workers.get_mut(worker_id) {
                Some(entry) => {
                    entry.last_heartbeat = Instant::now();
                    entry.healthy = true;
                    true
                }
                None => false,
            }
        };

        if known {
            self.available.notify_waiters();
        }

        known
    }

    pub fn healthy_count(&self) -> usize {
        self.inner
            .lock()
            .workers
            .values()
            .filter(|w| w.healthy)
            .count()
    }

    /// Acquire up to `n` healthy workers with the lowest in-flight task
    /// count, preferring workers outside `exclude`. Blocks up to the
    /// acquire timeout when none are available.
    pub async fn acquire(&self, n: usize, exclude: &[String]) -> Result<Vec<WorkerRef>, Error> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let acquired = self.try_acquire(n, exclude);
            if !acquired.is_empty() {
                return Ok(acquired);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::NoWorkers);
            }
            if timeout(remaining, self.available.notified()).await.is_err() {
                return Err(Error::NoWorkers);
            }
        }
    }

    fn try_acquire(&self, n: usize, exclude: &[String]) -> Vec<WorkerRef> {
        let mut inner = self.inner.lock();
        let mut acquired: Vec<WorkerRef> = vec![];

        for _ in 0..n {
            let candidates = |inner: &Inner, honor_exclude: bool| -> Vec<(usize, String)> {
                let mut found: Vec<(usize, String)> = inner
                    .workers
                    .values()
                    .filter(|w| {
                        w.healthy
                            && !acquired.iter().any(|a| a.id == w.id)
                            && (!honor_exclude || !exclude.contains(&w.id))
                    })
                    .map(|w| (w.in_flight, w.id.clone()))
                    .collect();
                found.sort();
                found
            };

            // Exclusion is a preference: with nothing else to pick from,
            // a previously failing worker beats NoWorkers.
            let mut found = candidates(&inner, true);
            if found.is_empty() {
                found = candidates(&inner, false);
            }
            if found.is_empty() {
                break;
            }

            // Lowest load first; ties broken round-robin over worker id.
            let min_load = found[0].0;
            let tied: Vec<&(usize, String)> =
                found.iter().take_while(|c| c.0 == min_load).collect();
            let id = tied[inner.round_robin % tied.len()].1.clone();
            inner.round_robin = inner.round_robin.wrapping_add(1);

            let entry = inner.workers.get_mut(&id).unwrap();
            entry.in_flight += 1;
            acquired.push(WorkerRef {
                id: entry.id.clone(),
                address: entry.address.clone(),
            });
        }

        acquired
    }

    /// Return a worker after a task. Failed tasks count toward the
    /// failure threshold; crossing it marks the worker unhealthy until
    /// its next heartbeat.
    pub fn release(&self, worker_id: &str, ok: bool) {
        {
            let mut inner = self.inner.lock();
            let threshold = self.config.failure_threshold;

            if let Some(entry) = inner.workers.get_mut(worker_id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);

                if ok {
                    entry.consecutive_failures = 0;
                } else {
                    entry.consecutive_failures += 1;
                    if entry.consecutive_failures >= threshold && entry.healthy {
                        warn!(
                            "worker \"{}\" unhealthy after {} consecutive failures",
                            worker_id, entry.consecutive_failures
                        );
                        entry.healthy = false;
                    }
                }
            }
        }

        self.available.notify_waiters();
    }

    /// Mark workers unhealthy past the TTL and drop them entirely after
    /// twice the TTL.
    pub fn sweep(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let ttl = self.config.worker_ttl;

        inner.workers.retain(|id, entry| {
            let stale = now.saturating_duration_since(entry.last_heartbeat);
            if stale >= ttl * 2 {
                warn!("worker \"{}\" removed, no heartbeat for {:?}", id, stale);
                return false;
            }
            if stale >= ttl && entry.healthy {
                warn!("worker \"{}\" unhealthy, no heartbeat for {:?}", id, stale);
                entry.healthy = false;
            }
            true
        });
    }

    /// Background TTL sweep.
    pub fn launch_sweeper(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let registry = self.clone();
        let period = (self.config.worker_ttl / 2).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => registry.sweep(Instant::now()),
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry(acquire_timeout_ms: u64) -> Registry {
        Registry::new(RegistryConfig {
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            worker_ttl: Duration::from_millis(500),
            failure_threshold: 2,
        })
    }

    #[tokio::test]
    async fn test_acquire_prefers_lowest_load() {
        let registry = registry(100);
        registry.register("w1", "addr1");
        registry.register("w2", "addr2");

        let first = registry.acquire(1, &[]).await.unwrap();
        let second = registry.acquire(1, &[]).await.unwrap();
        // Both workers are busy once, the pair was used evenly.
        assert_ne!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn test_acquire_up_to_n() {
        let registry = registry(100);
        registry.register("w1", "addr1");
        registry.register("w2", "addr2");

        let acquired = registry.acquire(4, &[]).await.unwrap();
        assert_eq!(acquired.len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_empty_registry_times_out() {
        let registry = registry(50);
        let start = Instant::now();
        let err = registry.acquire(1, &[]).await.unwrap_err();
        assert!(matches!(err, Error::NoWorkers));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_wakes_on_register() {
        let registry = Arc::new(registry(1_000));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(1, &[]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register("w1", "addr1");

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired[0].id, "w1");
    }

    #[tokio::test]
    async fn test_exclusion_is_a_preference() {
        let registry = registry(100);
        registry.register("w1", "addr1");

        let acquired = registry.acquire(1, &["w1".to_string()]).await.unwrap();
        assert_eq!(acquired[0].id, "w1");

        registry.register("w2", "addr2");
        let acquired = registry.acquire(1, &["w2".to_string()]).await.unwrap();
        assert_eq!(acquired[0].id, "w1");
    }

    #[tokio::test]
    async fn test_failure_threshold_marks_unhealthy() {
        let registry = registry(50);
        registry.register("w1", "addr1");

        registry.release("w1", false);
        assert_eq!(registry.healthy_count(), 1);
        registry.release("w1", false);
        assert_eq!(registry.healthy_count(), 0);

        assert!(registry.acquire(1, &[]).await.is_err());

        // A heartbeat brings it back.
        registry.register("w1", "addr1");
        assert_eq!(registry.healthy_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_failure_count() {
        let registry = registry(50);
        registry.register("w1", "addr1");

        registry.release("w1", false);
        assert!(registry.heartbeat("w1"));
        registry.release("w1", false);
        // The refresh between failures didn't wipe the first one.
        assert_eq!(registry.healthy_count(), 0);

        // A heartbeat clears the unhealthy mark but not the count, so
        // the next failure trips the threshold immediately.
        assert!(registry.heartbeat("w1"));
        assert_eq!(registry.healthy_count(), 1);
        registry.release("w1", false);
        assert_eq!(registry.healthy_count(), 0);

        // Unknown workers are not created by a bare refresh.
        assert!(!registry.heartbeat("w2"));
        assert_eq!(registry.healthy_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_marks_then_removes() {
        let registry = registry(50);
        registry.register("w1", "addr1");

        registry.sweep(Instant::now() + Duration::from_millis(600));
        assert_eq!(registry.healthy_count(), 0);

        registry.sweep(Instant::now() + Duration::from_millis(1_100));
        let inner = registry.inner.lock();
        assert!(inner.workers.is_empty());
    }
}
