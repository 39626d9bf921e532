use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use color_eyre::{Result, eyre::ensure};
use log::info;
use tokenizers::Tokenizer;

use crate::{ModelError, hub::Hub};

pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Sentence embeddings from a BERT encoder: mean of the token states over the
/// attention mask, scaled to unit length.
#[derive(Clone)]
pub struct SentenceEmbedder {
    inner: Arc<Encoder>,
}

struct Encoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl SentenceEmbedder {
    pub async fn load(hub: &Hub, model_id: &str, device: Device) -> Result<Self> {
        let repo = hub.model(model_id);
        let config_file = repo.get("config.json").await?;
        let tokenizer_file = repo.get("tokenizer.json").await?;
        let weights = repo.get("model.safetensors").await?;

        info!("Loading sentence encoder {model_id}");
        let encoder = tokio::task::spawn_blocking(move || -> Result<Encoder> {
            let config: BertConfig = serde_json::from_slice(&std::fs::read(config_file)?)?;
            let mut tokenizer =
                Tokenizer::from_file(tokenizer_file).map_err(ModelError::tokenizer)?;
            tokenizer.with_padding(None);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
            let model = BertModel::load(vb, &config)?;
            Ok(Encoder {
                model,
                tokenizer,
                device,
            })
        })
        .await??;

        Ok(Self {
            inner: Arc::new(encoder),
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let encoder = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || encoder.embed(&text)).await?
    }
}

impl Encoder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(ModelError::tokenizer)?;
        let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let type_ids = ids.zeros_like()?;
        let mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self.model.forward(&ids, &type_ids, Some(&mask))?;
        let pooled = mean_pool(&hidden, &mask)?;
        Ok(l2_normalize(pooled.squeeze(0)?.to_vec1::<f32>()?))
    }
}

/// `(batch, seq, hidden)` states and a `(batch, seq)` mask to `(batch, hidden)`.
fn mean_pool(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?;
    Ok(summed.broadcast_div(&counts)?)
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// 0.0 if either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    ensure!(
        a.len() == b.len(),
        "can't compare embeddings of length {} and {}",
        a.len(),
        b.len()
    );
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}
