// =============================================================================
// Market — snapshot acquisition and candidate pool construction
// =============================================================================

pub mod candidate_pool;
pub mod snapshot;

pub use candidate_pool::{build_candidate_pool, Candidate, CandidateSource};
pub use snapshot::{MarketClient, MarketSnapshot};
