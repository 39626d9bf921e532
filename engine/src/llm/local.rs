use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::qwen2::{Config as Qwen2Config, ModelForCausalLM},
};
use color_eyre::{Result, eyre::eyre};
use log::{debug, info};
use tokenizers::Tokenizer;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{LLM, LLMStream, OutputMessage, Request, ResponseFragment, SamplingParams, TokenDecoder};
use crate::{ModelError, hub::Hub};

const EOS_TOKENS: &[&str] = &["<|endoftext|>", "<|im_end|>", "</s>"];
/// How many trailing tokens the repeat penalty looks at.
const REPEAT_LAST_N: usize = 64;

/// A causal language model running on the local machine.
#[derive(Clone)]
pub struct LocalCausalLM {
    inner: Arc<Mutex<Generator>>,
}

struct Generator {
    model: ModelForCausalLM,
    tokenizer: Tokenizer,
    params: SamplingParams,
    eos_tokens: Vec<u32>,
    device: Device,
}

impl LocalCausalLM {
    pub async fn load(
        hub: &Hub,
        model_id: &str,
        device: Device,
        params: SamplingParams,
    ) -> Result<Self> {
        let repo = hub.model(model_id);
        let config_file = repo.get("config.json").await?;
        let tokenizer_file = repo.get("tokenizer.json").await?;
        let weight_files = repo.get_safetensors().await?;

        info!("Loading {model_id} from {} weight file(s)", weight_files.len());
        let generator = tokio::task::spawn_blocking(move || -> Result<Generator> {
            let config: Qwen2Config = serde_json::from_slice(&std::fs::read(config_file)?)?;
            let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(ModelError::tokenizer)?;
            let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_files, dtype, &device)? };
            let model = ModelForCausalLM::new(&config, vb)?;
            Ok(Generator::new(model, tokenizer, params, device))
        })
        .await??;

        Ok(Self {
            inner: Arc::new(Mutex::new(generator)),
        })
    }
}

impl LLM for LocalCausalLM {
    fn send_request_stream(&mut self, req: Request) -> LLMStream<'_> {
        let inner = Arc::clone(&self.inner);
        Box::pin(try_stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let handle = tokio::task::spawn_blocking(move || -> Result<()> {
                let mut generator = inner
                    .lock()
                    .map_err(|_| eyre!("text generator lock poisoned"))?;
                generator.generate(&req.prompt, req.max_tokens, &tx)
            });

            while let Some(fragment) = rx.recv().await {
                yield fragment;
            }
            handle.await??;
        })
    }

    fn clone(&self) -> Box<dyn LLM + Send + 'static> {
        Box::new(Clone::clone(self))
    }
}

impl Generator {
    fn new(
        model: ModelForCausalLM,
        tokenizer: Tokenizer,
        params: SamplingParams,
        device: Device,
    ) -> Self {
        let eos_tokens = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        Self {
            model,
            tokenizer,
            params,
            eos_tokens,
            device,
        }
    }

    /// Runs the sampling loop, sending text as it is produced. Stops early
    /// when the receiving side went away.
    fn generate(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        out: &UnboundedSender<ResponseFragment>,
    ) -> Result<()> {
        self.model.clear_kv_cache();
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(ModelError::tokenizer)?
            .get_ids()
            .to_vec();
        let input_tokens = tokens.len();
        debug!("Prompt has {input_tokens} tokens");

        let mut sampler: LogitsProcessor = self.params.logits_processor();
        let mut decoder = TokenDecoder::new(self.tokenizer.clone());

        for index in 0..max_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, start_pos)?
                .squeeze(0)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            let logits = if self.params.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(REPEAT_LAST_N);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.params.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next = sampler.sample(&logits)?;
            tokens.push(next);
            if self.eos_tokens.contains(&next) {
                break;
            }
            if let Some(text) = decoder.next_token(next)? {
                if out.send(ResponseFragment::TextDelta(text)).is_err() {
                    debug!("Receiver dropped, stopping generation");
                    return Ok(());
                }
            }
        }

        if let Some(rest) = decoder.decode_rest()? {
            let _ = out.send(ResponseFragment::TextDelta(rest));
        }
        let message = OutputMessage {
            input_tokens,
            output_tokens: decoder.token_count(),
            text: decoder.decode_all()?,
        };
        let _ = out.send(ResponseFragment::MessageComplete(message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::{Init, VarMap};

    use super::*;
    use crate::testing::word_tokenizer;

    const HELLO: u32 = 0;
    const END_OF_TEXT: u32 = 1;
    const WORDS: &[&str] = &["hello", "<|endoftext|>", "what", "is"];
    const HIDDEN: usize = 8;

    /// A one layer Qwen2 whose next token is always `favourite`: attention and
    /// MLP contribute nothing and the output head only scores one row.
    fn generator_preferring(favourite: u32) -> Result<Generator> {
        let config: Qwen2Config = serde_json::from_value(serde_json::json!({
            "vocab_size": WORDS.len(),
            "hidden_size": HIDDEN,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "max_position_embeddings": 32,
            "sliding_window": 32,
            "max_window_layers": 1,
            "tie_word_embeddings": false,
            "rope_theta": 10000.0,
            "rms_norm_eps": 1e-6,
            "use_sliding_window": false,
            "hidden_act": "silu",
        }))?;
        let device = Device::Cpu;
        let varmap = VarMap::new();
        // registered up front so the model gets its own output head
        varmap.get(
            (WORDS.len(), HIDDEN),
            "lm_head.weight",
            Init::Const(0.0),
            DType::F32,
            &device,
        )?;
        let model =
            ModelForCausalLM::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;

        for (name, var) in varmap.data().lock().unwrap().iter() {
            let value = if name == "lm_head.weight" {
                let rows: Vec<f32> = (0..WORDS.len() as u32)
                    .flat_map(|row| [if row == favourite { 1.0 } else { 0.0 }; HIDDEN])
                    .collect();
                Tensor::from_vec(rows, (WORDS.len(), HIDDEN), &device)?
            } else if name == "model.embed_tokens.weight" || name.ends_with("norm.weight") {
                var.ones_like()?
            } else {
                var.zeros_like()?
            };
            var.set(&value)?;
        }

        let params = SamplingParams {
            temperature: None,
            repeat_penalty: 1.0,
            ..SamplingParams::default()
        };
        Ok(Generator::new(model, word_tokenizer(WORDS), params, device))
    }

    fn run(generator: &mut Generator, max_tokens: usize) -> Result<(Vec<String>, OutputMessage)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        generator.generate("what is", max_tokens, &tx)?;
        drop(tx);

        let mut deltas = vec![];
        let mut message = None;
        while let Ok(fragment) = rx.try_recv() {
            match fragment {
                ResponseFragment::TextDelta(text) => deltas.push(text),
                ResponseFragment::MessageComplete(m) => message = Some(m),
            }
        }
        let message = message.ok_or_else(|| eyre!("no final message"))?;
        Ok((deltas, message))
    }

    #[test]
    fn stops_at_max_tokens() -> Result<()> {
        let mut generator = generator_preferring(HELLO)?;

        let (deltas, message) = run(&mut generator, 3)?;
        assert_eq!(deltas.concat(), "hello hello hello");
        assert_eq!(message.input_tokens, 2);
        assert_eq!(message.output_tokens, 3);
        assert_eq!(message.text, "hello hello hello");

        // the kv cache starts over for every request
        let (again, _) = run(&mut generator, 3)?;
        assert_eq!(again, deltas);
        Ok(())
    }

    #[test]
    fn end_of_text_ends_generation() -> Result<()> {
        let mut generator = generator_preferring(END_OF_TEXT)?;
        assert_eq!(generator.eos_tokens, vec![END_OF_TEXT]);

        let (deltas, message) = run(&mut generator, 5)?;
        assert!(deltas.is_empty());
        assert_eq!(message.output_tokens, 0);
        assert_eq!(message.text, "");
        Ok(())
    }

    #[test]
    fn dropped_receiver_stops_quietly() -> Result<()> {
        let mut generator = generator_preferring(HELLO)?;
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        generator.generate("what is", 10, &tx)
    }
}
