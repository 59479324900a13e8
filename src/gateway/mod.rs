//! Resilient content gateway.
//!
//! Gates content requests on conversation toggles, age verification and
//! cooldowns, then fetches through an ordered chain of upstream endpoints.

/// Content categories and endpoint chains.
pub mod catalog;
/// Injectable time source.
pub mod clock;
/// Fallback fetching with retries.
pub mod fetcher;
/// Identity normalization.
pub mod identity;
/// Request state machine.
pub mod orchestrator;
/// Verification records and group toggles.
pub mod policy;
/// Per-identity cooldowns.
pub mod rate_limit;
/// Upstream HTTP client and response decoding.
pub mod upstream;
/// Media-kind validation.
pub mod validator;

pub use orchestrator::{DeliveryInstruction, Denial, GatewayOrchestrator, GatewayStats};
