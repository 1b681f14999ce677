//! LLMHub provider.
//!
//! Publishes a model served by a local inference server (Ollama, llama.cpp,
//! vLLM or any JSON endpoint) to the LLMHub gateway over a WebSocket, and
//! runs the gateway's inference requests against it.

pub mod api;
pub mod backend;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod session;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use provider::Provider;
