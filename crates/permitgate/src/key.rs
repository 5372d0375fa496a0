//! State keys: immutable names for governed instance slots.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{PermitError, Result};

/// Sentinel for "no limit on concurrently outstanding permits".
pub const UNBOUNDED_PERMITS: usize = usize::MAX;

/// Names a slot governed by a [`PermitManager`](crate::PermitManager) and the
/// type of instance activated under it.
///
/// Equality and hashing use the name alone, so two keys with the same name
/// address the same slot even when their instance types differ. Callers must
/// not rely on the type to tell identically-named keys apart.
pub struct StateKey<T> {
    name: Cow<'static, str>,
    max_permits: usize,
    _instance: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    /// Key with no permit limit.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_max_permits(name, 0)
    }

    /// Key allowing at most `max_permits` outstanding permits. Zero means
    /// unbounded.
    pub fn with_max_permits(name: impl Into<String>, max_permits: usize) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PermitError::InvalidArgument(
                "state key name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name: Cow::Owned(name),
            max_permits: normalize(max_permits),
            _instance: PhantomData,
        })
    }

    /// Compile-time key for shared constants.
    pub const fn constant(name: &'static str, max_permits: usize) -> Self {
        assert!(!name.is_empty(), "state key name must not be empty");
        Self {
            name: Cow::Borrowed(name),
            max_permits: normalize(max_permits),
            _instance: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn is_bounded(&self) -> bool {
        self.max_permits != UNBOUNDED_PERMITS
    }

    /// Name of the instance type, for diagnostics only.
    pub fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

const fn normalize(max_permits: usize) -> usize {
    if max_permits == 0 {
        UNBOUNDED_PERMITS
    } else {
        max_permits
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_permits: self.max_permits,
            _instance: PhantomData,
        }
    }
}

impl<T, U> PartialEq<StateKey<U>> for StateKey<T> {
    fn eq(&self, other: &StateKey<U>) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for StateKey<T> {}

impl<T> Hash for StateKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StateKey");
        s.field("name", &self.name).field("type", &self.type_name());
        if self.is_bounded() {
            s.field("max_permits", &self.max_permits);
        }
        s.finish()
    }
}

impl<T> fmt::Display for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
