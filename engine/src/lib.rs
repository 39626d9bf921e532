use crate::llm::LLM;

pub mod chain;
pub mod config;
pub mod device;
pub mod embeddings;
pub mod error;
pub mod hub;
pub mod image_model;
pub mod llm;
pub mod random;
pub mod speech_model;

#[cfg(test)]
mod testing;

pub use error::ModelError;

pub type LLMBox = Box<dyn LLM + Send>;

pub const APP_NAME: &str = "GenAI Workshops";
