use std::pin::Pin;

use candle_transformers::generation::LogitsProcessor;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

pub trait LLM {
    fn send_request_stream(&mut self, req: Request) -> LLMStream<'_>;
    fn clone(&self) -> Box<dyn LLM + Send + 'static>;
}

pub type LLMStream<'a> = Pin<Box<dyn Stream<Item = Result<ResponseFragment>> + Send + 'a>>;

#[derive(Debug)]
pub enum ResponseFragment {
    TextDelta(String),
    MessageComplete(OutputMessage),
}

/// A plain completion request, the model continues `prompt`.
#[derive(Debug, Clone)]
pub struct Request {
    pub prompt: String,
    pub max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct OutputMessage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Generated continuation, without the prompt.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// `None` means greedy decoding.
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: u64,
    /// 1.0 disables the penalty.
    pub repeat_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: Some(0.8),
            top_p: None,
            seed: 299792458,
            repeat_penalty: 1.1,
        }
    }
}

impl SamplingParams {
    pub fn logits_processor(&self) -> LogitsProcessor {
        let temperature = self.temperature.filter(|t| *t > 0.0);
        LogitsProcessor::new(self.seed, temperature, self.top_p)
    }
}

mod local;
mod token_decoder;

pub use local::LocalCausalLM;
pub use token_decoder::TokenDecoder;
