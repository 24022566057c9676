//! Ingestion core: command parsing, conversation state, media intake,
//! generation, classification, and the post store.

pub mod commands;
pub mod database;
pub mod dates;
pub mod engine;
pub mod generate;
pub mod html;
pub mod media;
pub mod session;
pub mod vision;

#[cfg(test)]
mod tests;

pub use commands::PostType;
pub use database::Database;
pub use engine::{Engine, EngineConfig};
pub use media::BlobStore;
pub use session::SessionStore;
