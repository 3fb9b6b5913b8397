//! Messenger abstractions used by the services (Telegram is the only adapter).

pub mod port;
pub mod throttled;
pub mod types;
