/// Command parsing and handlers
pub mod handlers;
/// Telegram sends with retry
pub mod resilient;
