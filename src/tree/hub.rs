//! Hub: the reference-counted holder registry.
//!
//! Lookup, creation and reference counting happen under one registry lock;
//! starting a holder and waiting for its first snapshot happen outside it.
//! New holders pass a FIFO startup gate so that at most
//! `startup_concurrency` subtree watches are being registered at once.
//! Holders whose count drops to zero stay registered until the cleaner
//! evicts them, so quick long-poll reconnects reuse the warm mirror.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::validate_name;
use super::HolderKey;
use super::HolderState;
use super::TreeHolder;
use super::TreeHolderCleaner;
use super::TreeType;
use crate::config::HubConfig;
use crate::metrics::HOLDERS_GAUGE;
use crate::metrics::HOLDER_INIT_DURATION;
use crate::metrics::HOLDER_INIT_FAILURES;
use crate::store::CoordinationStore;
use crate::Error;
use crate::Result;
use crate::WatchError;

struct HolderSlot {
    holder: Arc<TreeHolder>,
    refs: usize,
}

/// Registry snapshot used by eviction predicates and metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub holder_count: usize,
    /// Holders with at least one outstanding lease
    pub referenced_count: usize,
}

pub struct TreeHub {
    store: Arc<dyn CoordinationStore>,
    config: HubConfig,
    registry: Mutex<HashMap<HolderKey, HolderSlot>>,
    startup_gate: Arc<Semaphore>,
    cleaner: TreeHolderCleaner,
}

impl std::fmt::Debug for TreeHub {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TreeHub")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TreeHub {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: HubConfig,
        cleaner: TreeHolderCleaner,
    ) -> Self {
        let startup_gate = Arc::new(Semaphore::new(config.startup_concurrency));
        Self {
            store,
            config,
            registry: Mutex::new(HashMap::new()),
            startup_gate,
            cleaner,
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn cleaner(&self) -> &TreeHolderCleaner {
        &self.cleaner
    }

    /// Returns a lease on the initialized holder of `(application, tree_type)`,
    /// creating and starting the holder when none is registered.
    ///
    /// # Errors
    /// - `WatchError::InvalidSubscription` for malformed application names
    /// - `WatchError::HolderInitTimeout` when the startup slot or the first
    ///   snapshot is not obtained within `init_timeout_in_ms`
    /// - store errors raised while registering the subtree watch
    pub async fn get_or_create(
        self: &Arc<Self>,
        application: &str,
        tree_type: TreeType,
    ) -> Result<HolderLease> {
        validate_name("application", application)?;
        let key = HolderKey::new(application, tree_type);
        self.cleaner.track(&key);

        let (holder, created) = {
            let mut registry = self.registry.lock();
            let live = registry
                .get_mut(&key)
                .filter(|slot| slot.holder.state() != HolderState::Closed);
            let result = if let Some(slot) = live {
                slot.refs += 1;
                (slot.holder.clone(), false)
            } else {
                let holder = Arc::new(TreeHolder::new(
                    key.clone(),
                    self.store.clone(),
                    self.config.change_log_capacity,
                ));
                registry.insert(
                    key.clone(),
                    HolderSlot {
                        holder: holder.clone(),
                        refs: 1,
                    },
                );
                (holder, true)
            };
            HOLDERS_GAUGE.set(registry.len() as i64);
            result
        };

        let lease = HolderLease {
            hub: self.clone(),
            key: key.clone(),
            holder: holder.clone(),
            released: false,
        };

        let initialized = if created {
            debug!(holder = %key, "Creating holder");
            self.start_holder(&holder).await
        } else {
            holder.block_until_initialized(self.config.init_timeout()).await
        };

        match initialized {
            Ok(()) => Ok(lease),
            Err(e) => {
                drop(lease);
                self.evict_failed(&key, &holder);
                Err(e)
            }
        }
    }

    async fn start_holder(
        &self,
        holder: &Arc<TreeHolder>,
    ) -> Result<()> {
        let started = Instant::now();
        let timeout = self.config.init_timeout();

        // Dropping the permit on any exit path returns the startup slot.
        let _permit = match tokio::time::timeout(timeout, self.startup_gate.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(WatchError::GateClosed.into()),
            Err(_) => {
                HOLDER_INIT_FAILURES.with_label_values(&["timeout"]).inc();
                warn!(holder = %holder.key(), ?timeout, "Timed out waiting for a startup slot");
                return Err(init_timeout(holder, timeout));
            }
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        if let Err(e) = holder.start().await {
            HOLDER_INIT_FAILURES.with_label_values(&["store"]).inc();
            return Err(e);
        }

        match holder.block_until_initialized(remaining).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                HOLDER_INIT_DURATION.observe(elapsed.as_secs_f64());
                info!(holder = %holder.key(), ?elapsed, "Holder ready");
                Ok(())
            }
            Err(e) => {
                let reason = if e.is_timeout() { "timeout" } else { "closed" };
                HOLDER_INIT_FAILURES.with_label_values(&[reason]).inc();
                warn!(holder = %holder.key(), error = %e, "Holder failed to initialize");
                // Report the full budget rather than the remainder.
                if e.is_timeout() {
                    return Err(init_timeout(holder, timeout));
                }
                Err(e)
            }
        }
    }

    /// Drops one reference. Unknown keys and zero counts are no-ops.
    pub fn release(
        &self,
        application: &str,
        tree_type: TreeType,
    ) {
        let key = HolderKey::new(application, tree_type);
        let mut registry = self.registry.lock();
        if let Some(slot) = registry.get_mut(&key) {
            self.decrement(&key, slot);
        }
    }

    /// Releases a lease only if `holder` is still the registered instance
    fn release_lease(
        &self,
        key: &HolderKey,
        holder: &Arc<TreeHolder>,
    ) {
        let mut registry = self.registry.lock();
        if let Some(slot) = registry.get_mut(key) {
            if Arc::ptr_eq(&slot.holder, holder) {
                self.decrement(key, slot);
            }
        }
    }

    fn decrement(
        &self,
        key: &HolderKey,
        slot: &mut HolderSlot,
    ) {
        if slot.refs == 0 {
            return;
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            // Idle time is measured from the last release.
            self.cleaner.track(key);
            debug!(holder = %key, "Holder unreferenced");
        }
    }

    fn evict_failed(
        &self,
        key: &HolderKey,
        holder: &Arc<TreeHolder>,
    ) {
        let evicted = {
            let mut registry = self.registry.lock();
            let evictable = registry
                .get(key)
                .map(|slot| Arc::ptr_eq(&slot.holder, holder) && slot.refs == 0 && !holder.state().is_ready())
                .unwrap_or(false);
            if evictable {
                registry.remove(key);
                HOLDERS_GAUGE.set(registry.len() as i64);
            }
            evictable
        };
        if evicted {
            holder.close();
            self.cleaner.forget(key);
            debug!(holder = %key, "Evicted holder that failed to initialize");
        }
    }

    /// Removes and closes the holder if nobody references it
    pub fn try_evict(
        &self,
        key: &HolderKey,
    ) -> Option<Arc<TreeHolder>> {
        self.evict_if(key, || true)
    }

    /// Like [`Self::try_evict`], with `still_idle` consulted under the
    /// registry lock once the holder is known to be unreferenced
    pub(crate) fn evict_if(
        &self,
        key: &HolderKey,
        still_idle: impl FnOnce() -> bool,
    ) -> Option<Arc<TreeHolder>> {
        let holder = {
            let mut registry = self.registry.lock();
            match registry.get(key) {
                Some(slot) if slot.refs == 0 && still_idle() => {
                    let holder = registry.remove(key).map(|slot| slot.holder);
                    HOLDERS_GAUGE.set(registry.len() as i64);
                    holder
                }
                _ => None,
            }
        }?;
        holder.close();
        Some(holder)
    }

    /// Closes every holder regardless of references
    pub fn close_all(&self) {
        let holders: Vec<Arc<TreeHolder>> = {
            let mut registry = self.registry.lock();
            let holders = registry.drain().map(|(_, slot)| slot.holder).collect();
            HOLDERS_GAUGE.set(0);
            holders
        };
        info!(count = holders.len(), "Closing all holders");
        for holder in holders {
            self.cleaner.forget(holder.key());
            holder.close();
        }
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.lock();
        HubStats {
            holder_count: registry.len(),
            referenced_count: registry.values().filter(|slot| slot.refs > 0).count(),
        }
    }

    /// Outstanding leases on `(application, tree_type)`, `None` if not registered
    pub fn reference_count(
        &self,
        application: &str,
        tree_type: TreeType,
    ) -> Option<usize> {
        let key = HolderKey::new(application, tree_type);
        self.registry.lock().get(&key).map(|slot| slot.refs)
    }

    /// The registered holder without taking a reference
    pub fn holder(
        &self,
        application: &str,
        tree_type: TreeType,
    ) -> Option<Arc<TreeHolder>> {
        let key = HolderKey::new(application, tree_type);
        self.registry.lock().get(&key).map(|slot| slot.holder.clone())
    }

    pub fn init_timeout(&self) -> Duration {
        self.config.init_timeout()
    }

    /// Spawns the periodic cleaner loop; `None` when the cleaner is disabled
    pub fn spawn_cleaner(
        self: &Arc<Self>,
        shutdown: watch::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        if !self.cleaner.enabled() {
            info!("Holder cleaner disabled");
            return None;
        }
        let hub = self.clone();
        Some(tokio::spawn(async move { hub.cleaner.run(&hub, shutdown).await }))
    }
}

fn init_timeout(
    holder: &TreeHolder,
    timeout: Duration,
) -> Error {
    WatchError::HolderInitTimeout {
        application: holder.key().application.clone(),
        tree_type: holder.key().tree_type,
        timeout,
    }
    .into()
}

/// One reference on a holder, released exactly once on drop
pub struct HolderLease {
    hub: Arc<TreeHub>,
    key: HolderKey,
    holder: Arc<TreeHolder>,
    released: bool,
}

impl std::fmt::Debug for HolderLease {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HolderLease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl HolderLease {
    pub fn key(&self) -> &HolderKey {
        &self.key
    }

    pub fn holder(&self) -> &Arc<TreeHolder> {
        &self.holder
    }

    /// Returns the reference early; later calls and the drop are no-ops
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.hub.release_lease(&self.key, &self.holder);
    }
}

impl Drop for HolderLease {
    fn drop(&mut self) {
        self.release();
    }
}
