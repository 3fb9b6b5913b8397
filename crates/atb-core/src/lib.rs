//! Core domain + application logic for the assistant Telegram bot.
//!
//! This crate is framework-agnostic. Telegram, OpenAI and Crypto Pay live
//! behind ports (traits) implemented in adapter crates.

pub mod assistant;
pub mod chat;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod security;
pub mod store;
pub mod streaming;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
