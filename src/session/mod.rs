//! Sessions: one connection, its memoised transfer handle and defaults.

mod async_client;
mod client;
mod config;

pub use async_client::AsyncSession;
pub use client::Session;
pub use config::SessionConfig;
