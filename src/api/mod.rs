// =============================================================================
// API — read-only fleet views plus the two position-closing actions
// =============================================================================

pub mod dto;
pub mod rest;

pub use rest::{router, ApiState};
