// =============================================================================
// AI — transport client, multi-agent consensus, prompt construction
// =============================================================================

pub mod client;
pub mod multi_agent;
pub mod prompt;

pub use client::{AiClient, HttpAiClient};
pub use multi_agent::run_multi_agent;
pub use prompt::{build_system_prompt, build_user_prompt};
