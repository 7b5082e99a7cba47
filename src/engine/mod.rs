// =============================================================================
// Engine — per-trader cycle state machine, position-closing locks, context
// =============================================================================

pub mod context;
pub mod cycle;
pub mod locks;
pub mod monitor;

pub use cycle::{CopySource, TraderEngine};
pub use locks::PositionClosingLocks;
