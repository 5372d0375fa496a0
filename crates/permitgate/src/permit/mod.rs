//! Permit manager for named, swappable active instances.
//!
//! A slot moves through three phases:
//! - `Inactive` → `Active` via `activate()`
//! - `Active` → `Inactive` via `deactivate()` once no permits are outstanding
//! - `Active` → `Draining` while a deactivation waits for permits, or while
//!   permits from an earlier activation are still held
//!
//! Permits are only granted in `Active`.

mod handle;
mod manager;
mod slot;

pub use handle::Permit;
pub use manager::PermitManager;
pub use slot::{SlotPhase, SlotSnapshot};
