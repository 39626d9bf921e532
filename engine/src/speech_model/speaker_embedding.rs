//! Cached speaker embedding. The first run draws one from a seeded normal
//! distribution and stores it, later runs load that file unchanged.

use std::{fs, path::Path};

use candle_core::{DType, Device, Tensor};
use color_eyre::{Result, eyre::WrapErr as _};
use log::info;

use crate::{ModelError, random::seeded_normal};

pub const TENSOR_NAME: &str = "spk_emb";
pub const EMBEDDING_DIM: usize = 256;
pub const DEFAULT_SEED: u64 = 0;

pub fn load_or_create(path: &Path, seed: u64, device: &Device) -> Result<Tensor> {
    if path.exists() {
        info!("Loading speaker embedding from {}", path.display());
        load(path, device)
    } else {
        info!("Creating speaker embedding at {}", path.display());
        let embedding = create(path, seed)?;
        Ok(embedding.to_device(device)?)
    }
}

pub fn load(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .wrap_err_with(|| format!("reading speaker embedding {}", path.display()))?;
    let embedding = tensors
        .remove(TENSOR_NAME)
        .ok_or_else(|| ModelError::MissingTensor {
            name: TENSOR_NAME.to_string(),
            path: path.to_path_buf(),
        })?;
    Ok(embedding.to_dtype(DType::F32)?)
}

fn create(path: &Path, seed: u64) -> Result<Tensor> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let embedding = seeded_normal(seed, (1, EMBEDDING_DIM), &Device::Cpu)?;
    embedding
        .save_safetensors(TENSOR_NAME, path)
        .wrap_err_with(|| format!("writing speaker embedding {}", path.display()))?;
    Ok(embedding)
}
