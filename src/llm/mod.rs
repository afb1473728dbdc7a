//! Model-backed fix generation over an OpenAI-compatible chat API.

mod client;
mod generator;
mod parse;
mod prompts;

pub use client::{LlmResponse, OpenRouterClient, Usage};
pub use generator::LlmFixGenerator;
