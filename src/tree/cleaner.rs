//! Background eviction of idle holders.
//!
//! The cleaner keeps a time-ordered index of the last interest shown in each
//! holder. Every sweep asks the [`EvictionCondition`] whether evicting is
//! worthwhile right now, closes unreferenced holders idle for longer than the
//! retention window, and drops index entries older than the stale horizon so
//! the index cannot grow without bound. Sweeps never fail the loop.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::HolderKey;
use super::HubStats;
use super::TreeHub;
use crate::config::CleanerConfig;
use crate::metrics::CLEANER_EVICTIONS;
use crate::metrics::CLEANER_SWEEP_FAILURES;
use crate::Result;

/// Runtime gate deciding whether a sweep may evict anything
pub trait EvictionCondition: Send + Sync + 'static {
    fn should_evict(
        &self,
        stats: &HubStats,
    ) -> Result<bool>;
}

impl<F> EvictionCondition for F
where
    F: Fn(&HubStats) -> Result<bool> + Send + Sync + 'static,
{
    fn should_evict(
        &self,
        stats: &HubStats,
    ) -> Result<bool> {
        self(stats)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEvict;

impl EvictionCondition for AlwaysEvict {
    fn should_evict(
        &self,
        _stats: &HubStats,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Evicts only while the hub holds more than `min_holders` holders
#[derive(Debug, Clone, Copy)]
pub struct HolderCountAbove(pub usize);

impl EvictionCondition for HolderCountAbove {
    fn should_evict(
        &self,
        stats: &HubStats,
    ) -> Result<bool> {
        Ok(stats.holder_count > self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<HolderKey>,
    /// Index entries dropped past the stale horizon
    pub purged: usize,
}

#[derive(Default)]
struct InterestIndex {
    by_time: BTreeMap<Instant, HolderKey>,
    by_key: HashMap<HolderKey, Instant>,
    last: Option<Instant>,
}

impl InterestIndex {
    fn touch(
        &mut self,
        key: &HolderKey,
        now: Instant,
    ) -> Instant {
        // Timestamps are strictly increasing so every key owns a distinct slot.
        let at = match self.last {
            Some(last) if now <= last => last + Duration::from_nanos(1),
            _ => now,
        };
        self.last = Some(at);

        if let Some(previous) = self.by_key.insert(key.clone(), at) {
            self.by_time.remove(&previous);
        }
        self.by_time.insert(at, key.clone());
        at
    }

    fn remove(
        &mut self,
        key: &HolderKey,
    ) {
        if let Some(at) = self.by_key.remove(key) {
            self.by_time.remove(&at);
        }
    }

    /// Removes `key` only if its entry was not refreshed since `at`
    fn remove_if_unchanged(
        &mut self,
        key: &HolderKey,
        at: Instant,
    ) -> bool {
        if self.by_key.get(key) == Some(&at) {
            self.by_key.remove(key);
            self.by_time.remove(&at);
            true
        } else {
            false
        }
    }

    fn older_than(
        &self,
        cutoff: Instant,
    ) -> Vec<(Instant, HolderKey)> {
        self.by_time
            .range(..=cutoff)
            .map(|(at, key)| (*at, key.clone()))
            .collect()
    }
}

pub struct TreeHolderCleaner {
    config: CleanerConfig,
    condition: Arc<dyn EvictionCondition>,
    index: Mutex<InterestIndex>,
}

impl std::fmt::Debug for TreeHolderCleaner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TreeHolderCleaner")
            .field("config", &self.config)
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl TreeHolderCleaner {
    pub fn new(
        config: CleanerConfig,
        condition: Arc<dyn EvictionCondition>,
    ) -> Self {
        Self {
            config,
            condition,
            index: Mutex::new(InterestIndex::default()),
        }
    }

    /// Cleaner gated by the configured minimum holder count
    pub fn from_config(config: CleanerConfig) -> Self {
        let condition = Arc::new(HolderCountAbove(config.min_holders));
        Self::new(config, condition)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Records interest in `key` now
    pub fn track(
        &self,
        key: &HolderKey,
    ) {
        self.index.lock().touch(key, Instant::now());
    }

    pub(crate) fn forget(
        &self,
        key: &HolderKey,
    ) {
        self.index.lock().remove(key);
    }

    /// Number of keys in the interest index
    pub fn tracked(&self) -> usize {
        self.index.lock().by_key.len()
    }

    pub fn sweep(
        &self,
        hub: &TreeHub,
    ) -> Result<SweepReport> {
        self.sweep_at(hub, Instant::now())
    }

    pub(crate) fn sweep_at(
        &self,
        hub: &TreeHub,
        now: Instant,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if self.condition.should_evict(&hub.stats())? {
            if let Some(cutoff) = now.checked_sub(self.config.retention()) {
                let candidates = self.idle_since(cutoff);
                report.evicted = self.evict_candidates(hub, candidates);
            }
        }

        if let Some(horizon) = now.checked_sub(self.config.stale_horizon()) {
            let mut index = self.index.lock();
            for (at, key) in index.older_than(horizon) {
                if index.remove_if_unchanged(&key, at) {
                    report.purged += 1;
                }
            }
        }

        Ok(report)
    }

    /// Interest entries recorded at or before `cutoff`
    pub(crate) fn idle_since(
        &self,
        cutoff: Instant,
    ) -> Vec<(Instant, HolderKey)> {
        self.index.lock().older_than(cutoff)
    }

    /// Evicts every candidate still unreferenced and not tracked again since
    /// it was sampled.
    pub(crate) fn evict_candidates(
        &self,
        hub: &TreeHub,
        candidates: Vec<(Instant, HolderKey)>,
    ) -> Vec<HolderKey> {
        let mut evicted = Vec::new();
        for (at, key) in candidates {
            // Lock order: registry, then index.
            let idle = || self.index.lock().remove_if_unchanged(&key, at);
            if hub.evict_if(&key, idle).is_some() {
                CLEANER_EVICTIONS.inc();
                debug!(holder = %key, "Evicted idle holder");
                evicted.push(key);
            }
        }
        evicted
    }

    pub(crate) async fn run(
        &self,
        hub: &TreeHub,
        mut shutdown: watch::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        info!(interval = ?self.config.sweep_interval(), "Holder cleaner started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Holder cleaner stopped");
                    break;
                }
                _ = interval.tick() => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| self.sweep(hub))) {
                        Ok(Ok(report)) => {
                            if !report.evicted.is_empty() || report.purged > 0 {
                                info!(evicted = report.evicted.len(), purged = report.purged, "Cleaner sweep done");
                            }
                        }
                        Ok(Err(e)) => {
                            CLEANER_SWEEP_FAILURES.inc();
                            error!(error = %e, "Cleaner sweep failed");
                        }
                        Err(_) => {
                            CLEANER_SWEEP_FAILURES.inc();
                            error!("Cleaner sweep panicked");
                        }
                    }
                }
            }
        }
    }
}
