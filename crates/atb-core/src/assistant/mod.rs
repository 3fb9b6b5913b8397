//! Hosted assistants: wire types, the API port, the run stream dispatcher,
//! function tools and the assistant library service.

pub mod api;
pub mod events;
pub mod service;
pub mod tools;
pub mod types;
