//! Providers
//!
//! OpenAI and LM Studio both speak the OpenAI HTTP API, so one client
//! serves chat, streaming chat and embeddings for either.

mod client;
mod config;

pub use client::*;
pub use config::*;
