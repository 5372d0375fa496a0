//! Permit manager: activation, deactivation, and permit issuance for every
//! key it has seen.
//!
//! Slots are created lazily and kept for the life of the manager. Each slot
//! has its own lock, so operations on unrelated keys never contend.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::handle::Permit;
use super::slot::{Drain, Grant, Instance, Slot, SlotPhase, SlotSnapshot};
use crate::config::PermitConfig;
use crate::error::{PermitError, Result, WaitMode};
use crate::key::StateKey;

/// How long a blocking operation may wait.
#[derive(Clone, Copy)]
enum WaitLimit<'a> {
    Unbounded,
    Timeout(Duration),
    Cancel(&'a CancellationToken),
}

/// Gates access to named active instances.
///
/// Any number of shared permits (up to the key's `max_permits`) may be held
/// at once; an exclusive permit excludes every other permit on its key.
/// Deactivation stops new grants immediately and completes once every permit
/// of the current activation has been released.
///
/// No permit is granted while any permit from an earlier activation of the
/// same key is still outstanding, even after a deactivate/activate cycle.
pub struct PermitManager {
    slots: DashMap<String, Arc<Slot>>,
    config: PermitConfig,
}

impl PermitManager {
    pub fn new() -> Self {
        Self::with_config(PermitConfig::default())
    }

    pub fn with_config(config: PermitConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PermitConfig {
        &self.config
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(name) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            self.slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Slot::new(name)))
                .value(),
        )
    }

    /// Install `instance` under `key` and wake blocked acquirers.
    ///
    /// Returns the new generation. Fails with `InvalidState` if the slot is
    /// already active or a deactivation is still waiting on it. A slot whose
    /// deactivation timed out may be activated again; its unreleased permits
    /// then block new grants until released.
    pub fn activate<T>(&self, key: &StateKey<T>, instance: impl Into<Arc<T>>) -> Result<u64>
    where
        T: Any + Send + Sync,
    {
        let instance: Arc<T> = instance.into();
        let instance: Instance = instance;
        let slot = self.slot(key.name());

        let activated = {
            let mut state = slot.lock();
            state
                .activate(instance)
                .map(|generation| (generation, state.stale()))
        };
        let (generation, stale) = match activated {
            Ok(activated) => activated,
            Err((_rejected, reason)) => {
                return Err(PermitError::invalid_state(key.name(), reason));
            }
        };
        slot.notify();

        if stale > 0 {
            tracing::warn!(
                key = %key,
                generation,
                stale,
                "Activated while earlier permits are outstanding; new permits wait for them"
            );
        } else {
            tracing::debug!(key = %key, generation, "Activated");
        }
        Ok(generation)
    }

    /// Deactivate `key`, waiting indefinitely for outstanding permits.
    pub async fn deactivate<T>(&self, key: &StateKey<T>) -> Result<()> {
        self.drain(key.name(), WaitLimit::Unbounded).await
    }

    /// Deactivate `key`, failing with `Timeout` if permits are still
    /// outstanding after `timeout`.
    ///
    /// On timeout the instance is kept and the slot stays draining: no new
    /// permits are granted until a later deactivation completes or a new
    /// activation replaces the instance.
    pub async fn deactivate_timeout<T>(&self, key: &StateKey<T>, timeout: Duration) -> Result<()> {
        self.drain(key.name(), WaitLimit::Timeout(timeout)).await
    }

    pub async fn deactivate_cancellable<T>(
        &self,
        key: &StateKey<T>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.drain(key.name(), WaitLimit::Cancel(cancel)).await
    }

    async fn drain(&self, name: &str, limit: WaitLimit<'_>) -> Result<()> {
        let slot = self.slot(name);
        let Some((target, _drainer)) = slot.begin_deactivate() else {
            tracing::debug!(key = %name, "Deactivate on inactive slot is a no-op");
            return Ok(());
        };
        tracing::debug!(key = %name, generation = target, "Deactivating");

        let wait = slot.wait_for(WaitMode::Deactivate, self.config.stall_warning, |state| {
            match state.poll_deactivate(target) {
                Drain::Pending => None,
                Drain::Finished(cleared) => Some(cleared),
            }
        });
        let cleared = match bounded(name, WaitMode::Deactivate, limit, wait).await {
            Ok(cleared) => cleared,
            Err(e) => {
                let snapshot = slot.lock().snapshot(name);
                tracing::warn!(
                    key = %name,
                    generation = target,
                    outstanding = snapshot.outstanding,
                    exclusive = snapshot.exclusive,
                    error = %e,
                    "Deactivation did not drain; slot stays draining"
                );
                return Err(e);
            }
        };
        slot.notify();

        match cleared {
            Some(_instance) => tracing::debug!(key = %name, generation = target, "Deactivated"),
            None => tracing::debug!(
                key = %name,
                generation = target,
                "Generation already retired by another caller"
            ),
        }
        Ok(())
    }

    /// Acquire a permit, waiting indefinitely for the slot to allow it.
    pub async fn acquire_permit<T>(&self, key: &StateKey<T>, exclusive: bool) -> Result<Permit<T>>
    where
        T: Any + Send + Sync,
    {
        self.acquire(key, exclusive, WaitLimit::Unbounded).await
    }

    /// Acquire a permit, failing with `Timeout` after `timeout`. A timed-out
    /// call changes nothing.
    pub async fn acquire_permit_timeout<T>(
        &self,
        key: &StateKey<T>,
        exclusive: bool,
        timeout: Duration,
    ) -> Result<Permit<T>>
    where
        T: Any + Send + Sync,
    {
        self.acquire(key, exclusive, WaitLimit::Timeout(timeout))
            .await
    }

    pub async fn acquire_permit_cancellable<T>(
        &self,
        key: &StateKey<T>,
        exclusive: bool,
        cancel: &CancellationToken,
    ) -> Result<Permit<T>>
    where
        T: Any + Send + Sync,
    {
        self.acquire(key, exclusive, WaitLimit::Cancel(cancel))
            .await
    }

    /// Grant a permit only if one is available right now.
    pub fn try_acquire_permit<T>(
        &self,
        key: &StateKey<T>,
        exclusive: bool,
    ) -> Result<Option<Permit<T>>>
    where
        T: Any + Send + Sync,
    {
        let slot = self.slot(key.name());
        let grant = slot.lock().try_grant::<T>(exclusive, key.max_permits());
        match grant {
            Grant::Blocked => Ok(None),
            Grant::Mismatch => Err(type_mismatch(key)),
            Grant::Granted(instance, generation) => {
                Ok(Some(self.issue(key, instance, generation, exclusive, slot)))
            }
        }
    }

    async fn acquire<T>(
        &self,
        key: &StateKey<T>,
        exclusive: bool,
        limit: WaitLimit<'_>,
    ) -> Result<Permit<T>>
    where
        T: Any + Send + Sync,
    {
        let slot = self.slot(key.name());
        let mode = WaitMode::for_acquire(exclusive);
        let max_permits = key.max_permits();

        let wait = slot.wait_for(mode, self.config.stall_warning, |state| {
            match state.try_grant::<T>(exclusive, max_permits) {
                Grant::Blocked => None,
                Grant::Mismatch => Some(Err(type_mismatch(key))),
                Grant::Granted(instance, generation) => Some(Ok((instance, generation))),
            }
        });
        let (instance, generation) = match bounded(key.name(), mode, limit, wait).await {
            Ok(granted) => granted?,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Permit not acquired");
                return Err(e);
            }
        };
        Ok(self.issue(key, instance, generation, exclusive, slot))
    }

    fn issue<T>(
        &self,
        key: &StateKey<T>,
        instance: Arc<T>,
        generation: u64,
        exclusive: bool,
        slot: Arc<Slot>,
    ) -> Permit<T> {
        tracing::debug!(key = %key, generation, exclusive, "Permit acquired");
        Permit::new(key.clone(), instance, generation, exclusive, slot)
    }

    /// Run `f` with the active instance while holding a permit. The permit is
    /// released on every exit path, including cancellation of the returned
    /// future.
    pub async fn with_permit<T, F, Fut, R>(
        &self,
        key: &StateKey<T>,
        exclusive: bool,
        f: F,
    ) -> Result<R>
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let permit = self.acquire_permit(key, exclusive).await?;
        let result = f(Arc::clone(permit.instance())).await;
        permit.release()?;
        Ok(result)
    }

    /// Whether new permits can currently be granted for `key`.
    pub fn is_active<T>(&self, key: &StateKey<T>) -> bool {
        self.slots
            .get(key.name())
            .is_some_and(|slot| slot.lock().phase() == SlotPhase::Active)
    }

    pub fn snapshot<T>(&self, key: &StateKey<T>) -> SlotSnapshot {
        match self.slots.get(key.name()) {
            Some(slot) => slot.lock().snapshot(slot.name()),
            None => SlotSnapshot::unseen(key.name()),
        }
    }

    /// Snapshots of every slot seen so far, sorted by name.
    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        let mut snapshots: Vec<_> = self
            .slots
            .iter()
            .map(|entry| entry.value().lock().snapshot(entry.key()))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for PermitManager {
    fn default() -> Self {
        Self::new()
    }
}

fn type_mismatch<T>(key: &StateKey<T>) -> PermitError {
    PermitError::invalid_state(
        key.name(),
        format!("active instance is not a {}", key.type_name()),
    )
}

async fn bounded<R>(
    name: &str,
    mode: WaitMode,
    limit: WaitLimit<'_>,
    wait: impl Future<Output = R>,
) -> Result<R> {
    match limit {
        WaitLimit::Unbounded => Ok(wait.await),
        WaitLimit::Timeout(timeout) => {
            tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| PermitError::Timeout {
                    key: name.to_string(),
                    mode,
                    timeout,
                })
        }
        WaitLimit::Cancel(cancel) => {
            tokio::select! {
                biased;
                result = wait => Ok(result),
                () = cancel.cancelled() => Err(PermitError::Cancelled {
                    key: name.to_string(),
                    mode,
                }),
            }
        }
    }
}
