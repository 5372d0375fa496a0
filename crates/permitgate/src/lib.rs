//! permitgate: permit-gated access to named, swappable active instances.
//!
//! A [`PermitManager`] holds one active instance per [`StateKey`]. Callers
//! read it through a [`Permit`], shared or exclusive, and transitions wait for
//! outstanding permits to drain before the instance is swapped.

mod config;
mod error;
mod key;
mod lifecycle;
pub mod permit;

pub use config::{PermitConfig, STALL_WARNING_ENV};
pub use error::{PermitError, Result, WaitMode};
pub use key::{StateKey, UNBOUNDED_PERMITS};
pub use lifecycle::Component;
pub use permit::{Permit, PermitManager, SlotPhase, SlotSnapshot};
pub use tokio_util::sync::CancellationToken;
