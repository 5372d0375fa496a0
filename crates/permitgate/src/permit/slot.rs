//! Per-key slot: the active instance, permit counters, and the signal that
//! wakes waiters whenever any of them change.
//!
//! All counters live behind one `std::sync::Mutex` that is never held across
//! an await. Waiters arm a `Notified` future before inspecting state so a
//! release that lands between the check and the sleep is never missed.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

use crate::error::WaitMode;

pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

/// Externally visible phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotPhase {
    /// No instance installed.
    Inactive,
    /// Instance installed and permits may be granted.
    Active,
    /// Instance installed but no new permits: either a deactivation is
    /// waiting for permits to drain, or permits from an earlier activation
    /// are still outstanding.
    Draining,
}

/// Point-in-time view of a slot for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub name: String,
    pub phase: SlotPhase,
    pub generation: u64,
    /// All unreleased permits, including stale ones.
    pub outstanding: usize,
    /// Unreleased permits issued under an earlier generation.
    pub stale: usize,
    pub exclusive: bool,
}

impl SlotSnapshot {
    pub(crate) fn unseen(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: SlotPhase::Inactive,
            generation: 0,
            outstanding: 0,
            stale: 0,
            exclusive: false,
        }
    }
}

pub(crate) enum Grant<T> {
    Blocked,
    Mismatch,
    Granted(Arc<T>, u64),
}

pub(crate) enum Drain {
    Pending,
    /// The targeted generation is gone. Carries the instance when this call
    /// was the one that cleared it.
    Finished(Option<Instance>),
}

#[derive(Default)]
pub(crate) struct SlotState {
    instance: Option<Instance>,
    generation: u64,
    draining: bool,
    /// Deactivations currently waiting for the drain to finish.
    drainers: usize,
    outstanding: usize,
    stale: usize,
    exclusive: bool,
}

impl SlotState {
    pub(crate) fn phase(&self) -> SlotPhase {
        match self.instance {
            None => SlotPhase::Inactive,
            Some(_) if self.draining || self.stale > 0 => SlotPhase::Draining,
            Some(_) => SlotPhase::Active,
        }
    }

    pub(crate) fn stale(&self) -> usize {
        self.stale
    }

    /// Permits issued under the current generation.
    fn current(&self) -> usize {
        self.outstanding - self.stale
    }

    fn can_grant(&self, exclusive: bool, max_permits: usize) -> bool {
        self.phase() == SlotPhase::Active
            && !self.exclusive
            && self.outstanding < max_permits
            && (!exclusive || self.outstanding == 0)
    }

    pub(crate) fn try_grant<T>(&mut self, exclusive: bool, max_permits: usize) -> Grant<T>
    where
        T: Any + Send + Sync,
    {
        let instance = match &self.instance {
            None => return Grant::Blocked,
            Some(instance) if !(**instance).is::<T>() => return Grant::Mismatch,
            Some(instance) => Arc::clone(instance),
        };
        if !self.can_grant(exclusive, max_permits) {
            return Grant::Blocked;
        }
        let Ok(instance) = instance.downcast::<T>() else {
            return Grant::Mismatch;
        };

        self.outstanding += 1;
        if exclusive {
            self.exclusive = true;
        }
        Grant::Granted(instance, self.generation)
    }

    pub(crate) fn release(&mut self, generation: u64, exclusive: bool) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if generation != self.generation {
            self.stale = self.stale.saturating_sub(1);
        }
        if exclusive {
            self.exclusive = false;
        }
    }

    /// Install `instance` as a new generation. Rejects (and hands back) the
    /// instance when the slot is active, or when a deactivation is still
    /// waiting on it. Only a draining slot nobody waits on (its deactivation
    /// timed out or was cancelled) may be replaced.
    ///
    /// Every permit still outstanding becomes stale and blocks new grants
    /// until released.
    pub(crate) fn activate(
        &mut self,
        instance: Instance,
    ) -> Result<u64, (Instance, &'static str)> {
        if self.instance.is_some() {
            if !self.draining {
                return Err((instance, "slot is already active"));
            }
            if self.drainers > 0 {
                return Err((instance, "slot is being deactivated"));
            }
        }
        self.instance = Some(instance);
        self.generation += 1;
        self.draining = false;
        self.stale = self.outstanding;
        Ok(self.generation)
    }

    /// Stop granting permits. Returns the generation being drained, or
    /// `None` if the slot is already inactive.
    pub(crate) fn begin_deactivate(&mut self) -> Option<u64> {
        self.instance.as_ref()?;
        self.draining = true;
        self.drainers += 1;
        Some(self.generation)
    }

    /// A deactivation stopped waiting, whether it finished or gave up.
    pub(crate) fn end_deactivate(&mut self) {
        self.drainers = self.drainers.saturating_sub(1);
    }

    pub(crate) fn poll_deactivate(&mut self, target: u64) -> Drain {
        if self.generation != target || self.instance.is_none() {
            return Drain::Finished(None);
        }
        if self.current() > 0 {
            return Drain::Pending;
        }
        self.draining = false;
        Drain::Finished(self.instance.take())
    }

    pub(crate) fn snapshot(&self, name: &str) -> SlotSnapshot {
        SlotSnapshot {
            name: name.to_string(),
            phase: self.phase(),
            generation: self.generation,
            outstanding: self.outstanding,
            stale: self.stale,
            exclusive: self.exclusive,
        }
    }
}

pub(crate) struct DrainGuard<'a> {
    slot: &'a Slot,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().end_deactivate();
    }
}

pub(crate) struct Slot {
    name: String,
    state: Mutex<SlotState>,
    changed: Notify,
}

impl Slot {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SlotState::default()),
            changed: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Critical sections never panic, so a poisoned lock still guards
    /// consistent counters.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Start draining. The returned guard keeps re-activation blocked until
    /// it is dropped, so a deactivation that is still waiting cannot have its
    /// generation replaced underneath it.
    pub(crate) fn begin_deactivate(&self) -> Option<(u64, DrainGuard<'_>)> {
        let target = self.lock().begin_deactivate()?;
        Some((target, DrainGuard { slot: self }))
    }

    /// Evaluate `poll` under the lock until it yields, sleeping on state
    /// changes in between. Logs a warning every `stall_warning` spent blocked.
    pub(crate) async fn wait_for<R>(
        &self,
        mode: WaitMode,
        stall_warning: Duration,
        mut poll: impl FnMut(&mut SlotState) -> Option<R>,
    ) -> R {
        let started = Instant::now();
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = {
                let mut state = self.lock();
                poll(&mut state)
            };
            if let Some(result) = ready {
                return result;
            }

            if tokio::time::timeout(stall_warning, notified.as_mut())
                .await
                .is_err()
            {
                let snapshot = self.lock().snapshot(&self.name);
                tracing::warn!(
                    key = %self.name,
                    waiting_to = %mode,
                    elapsed = ?started.elapsed(),
                    phase = ?snapshot.phase,
                    outstanding = snapshot.outstanding,
                    stale = snapshot.stale,
                    "Still waiting on slot"
                );
            }
        }
    }

    /// Release one permit. The `released` flag is checked and set under the
    /// slot lock; returns `false` if it was already set.
    pub(crate) fn release(&self, released: &AtomicBool, generation: u64, exclusive: bool) -> bool {
        {
            let mut state = self.lock();
            if released.swap(true, Ordering::AcqRel) {
                return false;
            }
            state.release(generation, exclusive);
        }
        self.notify();
        true
    }
}
