//! Permit handle returned by a successful acquisition.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::slot::Slot;
use crate::error::{PermitError, Result};
use crate::key::StateKey;

/// Capability to read the instance that was active when the permit was
/// granted.
///
/// The captured instance stays valid for the life of the permit, even after
/// the slot is deactivated or re-activated with a different instance.
/// Release explicitly with [`Permit::release`]; an unreleased permit is
/// released when dropped.
pub struct Permit<T> {
    key: StateKey<T>,
    instance: Arc<T>,
    generation: u64,
    exclusive: bool,
    released: AtomicBool,
    slot: Arc<Slot>,
}

impl<T> Permit<T> {
    pub(crate) fn new(
        key: StateKey<T>,
        instance: Arc<T>,
        generation: u64,
        exclusive: bool,
        slot: Arc<Slot>,
    ) -> Self {
        Self {
            key,
            instance,
            generation,
            exclusive,
            released: AtomicBool::new(false),
            slot,
        }
    }

    pub fn key(&self) -> &StateKey<T> {
        &self.key
    }

    pub fn instance(&self) -> &Arc<T> {
        &self.instance
    }

    /// Activation generation the permit was issued under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the permit to its slot, waking blocked acquirers and
    /// deactivations.
    ///
    /// A second call fails with [`PermitError::DoubleRelease`] and leaves the
    /// slot's counters untouched.
    pub fn release(&self) -> Result<()> {
        if self
            .slot
            .release(&self.released, self.generation, self.exclusive)
        {
            tracing::debug!(
                key = %self.key,
                generation = self.generation,
                exclusive = self.exclusive,
                "Permit released"
            );
            Ok(())
        } else {
            tracing::error!(
                key = %self.key,
                generation = self.generation,
                "Bug: permit released more than once"
            );
            Err(PermitError::DoubleRelease {
                key: self.key.name().to_string(),
            })
        }
    }
}

impl<T> Deref for Permit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

impl<T> Drop for Permit<T> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire)
            && self
                .slot
                .release(&self.released, self.generation, self.exclusive)
        {
            tracing::debug!(
                key = %self.key,
                generation = self.generation,
                "Permit released on drop"
            );
        }
    }
}

impl<T> fmt::Debug for Permit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("key", &self.key.name())
            .field("slot", &self.slot.name())
            .field("generation", &self.generation)
            .field("exclusive", &self.exclusive)
            .field("released", &self.is_released())
            .finish()
    }
}
