use std::{
    pin::Pin,
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::{
        encodec,
        metavoice::{adapters, gpt, tokenizers::BPE, transformer},
    },
};
use color_eyre::{Result, eyre::eyre};
use log::{debug, info};

use super::{Speech, SpeechModel};
use crate::hub::Hub;

pub const DEFAULT_REPO: &str = "lmz/candle-metavoice";
pub const DEFAULT_SEED: u64 = 299792458;
const ENCODEC_REPO: &str = "facebook/encodec_24khz";
const SAMPLE_RATE: u32 = 24_000;

const ENCODEC_NTOKENS: u32 = 1024;
/// First stage token that ends the audio.
const END_OF_AUDIO: u32 = 2048;
const MAX_FIRST_STAGE_TOKENS: usize = 2000;
const GUIDANCE_SCALE: f64 = 3.0;
const TEMPERATURE: f64 = 1.0;
const TOP_P: f64 = 0.95;

/// MetaVoice-1B: a speaker conditioned transformer predicts the first two
/// EnCodec codebooks, a GPT fills in the rest, EnCodec turns codes into audio.
#[derive(Clone)]
pub struct MetaVoice {
    inner: Arc<Mutex<Stages>>,
}

struct Stages {
    tokenizer: BPE,
    first_stage: transformer::Model,
    second_stage: gpt::Model,
    second_stage_config: gpt::Config,
    encodec: encodec::Model,
    device: Device,
    encodec_device: Device,
    seed: u64,
}

impl MetaVoice {
    pub async fn load(hub: &Hub, repo_id: &str, device: Device, seed: u64) -> Result<Self> {
        let repo = hub.model(repo_id);
        let meta = repo.get("first_stage.meta.json").await?;
        let first_stage = repo.get("first_stage.safetensors").await?;
        let second_stage = repo.get("second_stage.safetensors").await?;
        let encodec = hub.model(ENCODEC_REPO).get("model.safetensors").await?;

        info!("Loading MetaVoice from {repo_id}");
        let stages = tokio::task::spawn_blocking(move || -> Result<Stages> {
            let meta: serde_json::Value = serde_json::from_slice(&std::fs::read(meta)?)?;
            let tokenizer_json = meta
                .get("tokenizer")
                .ok_or_else(|| eyre!("no tokenizer in first stage metadata"))?;
            let tokenizer = BPE::from_json(tokenizer_json, 512)?;

            let dtype = DType::F32;
            let first_vb =
                unsafe { VarBuilder::from_mmaped_safetensors(&[first_stage], dtype, &device)? };
            let first_stage = transformer::Model::new(&transformer::Config::cfg1b_v0_1(), first_vb)?;

            let second_stage_config = gpt::Config::cfg1b_v0_1();
            let second_vb =
                unsafe { VarBuilder::from_mmaped_safetensors(&[second_stage], dtype, &device)? };
            let second_stage = gpt::Model::new(second_stage_config.clone(), second_vb)?;

            // EnCodec has no Metal kernels for all its ops.
            let encodec_device = if device.is_metal() { Device::Cpu } else { device.clone() };
            let encodec_vb =
                unsafe { VarBuilder::from_mmaped_safetensors(&[encodec], dtype, &encodec_device)? };
            let encodec = encodec::Model::new(&encodec::Config::default(), encodec_vb)?;

            Ok(Stages {
                tokenizer,
                first_stage,
                second_stage,
                second_stage_config,
                encodec,
                device,
                encodec_device,
                seed,
            })
        })
        .await??;

        Ok(Self {
            inner: Arc::new(Mutex::new(stages)),
        })
    }
}

impl SpeechModel for MetaVoice {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        speaker: &'a Tensor,
    ) -> Pin<Box<dyn Future<Output = Result<Speech>> + Send + 'a>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        let speaker = speaker.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut stages = inner
                    .lock()
                    .map_err(|_| eyre!("speech model lock poisoned"))?;
                stages.synthesize(&text, &speaker)
            })
            .await?
        })
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl Stages {
    fn synthesize(&mut self, text: &str, speaker: &Tensor) -> Result<Speech> {
        let speaker = speaker.to_device(&self.device)?.to_dtype(DType::F32)?;
        let prompt_tokens = self.tokenizer.encode(text)?;
        debug!("{} prompt tokens", prompt_tokens.len());

        let tokens = self.semantic_tokens(&prompt_tokens, &speaker)?;
        let codes = self.acoustic_codes(&prompt_tokens, &tokens)?;

        let (_, audio_ids) = adapters::TiltedEncodec::new(ENCODEC_NTOKENS).decode(&codes);
        let audio_ids = Tensor::new(audio_ids, &self.encodec_device)?.unsqueeze(0)?;
        debug!("Decoding audio codes {:?}", audio_ids.shape());
        let pcm = self.encodec.decode(&audio_ids)?;
        let samples = pcm.i(0)?.i(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;

        let mut speech = Speech {
            samples,
            sample_rate: SAMPLE_RATE,
        };
        speech.normalize();
        Ok(speech)
    }

    /// Autoregressive pass with classifier free guidance over the speaker
    /// conditioned and unconditioned batch rows.
    fn semantic_tokens(&mut self, prompt_tokens: &[u32], speaker: &Tensor) -> Result<Vec<u32>> {
        self.first_stage.clear_kv_cache();
        let mut sampler = LogitsProcessor::new(self.seed, Some(TEMPERATURE), Some(TOP_P));
        let mut tokens = prompt_tokens.to_vec();

        for index in 0..MAX_FIRST_STAGE_TOKENS {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?;
            let input = Tensor::stack(&[&input, &input], 0)?;

            let logits = self.first_stage.forward(&input, speaker, start_pos)?;
            let last = logits.dim(1)? - 1;
            let conditioned = logits.i((0, last))?;
            let unconditioned = logits.i((1, last))?;
            let logits = ((conditioned * GUIDANCE_SCALE)? + (unconditioned * (1. - GUIDANCE_SCALE))?)?
                .to_dtype(DType::F32)?;

            let next = sampler.sample(&logits)?;
            tokens.push(next);
            if next == END_OF_AUDIO {
                break;
            }
        }
        debug!("First stage produced {} tokens", tokens.len() - prompt_tokens.len());
        Ok(tokens)
    }

    /// Predicts the remaining codebooks in one non-causal pass.
    fn acoustic_codes(&self, prompt_tokens: &[u32], tokens: &[u32]) -> Result<Vec<Vec<u32>>> {
        let (_, ids1, ids2) =
            adapters::FlattenedInterleavedEncodec2Codebook::new(ENCODEC_NTOKENS).decode(tokens);

        let encoded_text: Vec<u32> = prompt_tokens
            .iter()
            .map(|t| t.saturating_sub(ENCODEC_NTOKENS))
            .collect();
        let block_size = self.second_stage_config.block_size;
        let mut hierarchy1 = [encoded_text.as_slice(), ids1.as_slice(), &[ENCODEC_NTOKENS]].concat();
        let mut hierarchy2 = [
            vec![ENCODEC_NTOKENS; encoded_text.len()].as_slice(),
            ids2.as_slice(),
            &[ENCODEC_NTOKENS],
        ]
        .concat();
        hierarchy1.resize(block_size, ENCODEC_NTOKENS);
        hierarchy2.resize(block_size, ENCODEC_NTOKENS);

        let in_x = Tensor::stack(
            &[
                Tensor::new(hierarchy1, &self.device)?,
                Tensor::new(hierarchy2, &self.device)?,
            ],
            0,
        )?
        .unsqueeze(0)?;

        let mut sampler = LogitsProcessor::new(self.seed + 1337, Some(1.0), None);
        let mut codes = vec![];
        for head_logits in self.second_stage.forward(&in_x)? {
            let head_logits = head_logits.squeeze(0)?;
            let (seq_len, _) = head_logits.dims2()?;
            let mut head_codes = Vec::with_capacity(seq_len);
            for step in 0..seq_len {
                let logits = head_logits.i(step)?.to_dtype(DType::F32)?;
                head_codes.push(sampler.sample(&logits)?);
            }
            codes.push(head_codes);
        }

        let codes = Tensor::new(codes, &self.device)?.unsqueeze(0)?;
        let codes = Tensor::cat(&[in_x, codes], 1)?;
        Ok(codes.i(0)?.to_vec2::<u32>()?)
    }
}
