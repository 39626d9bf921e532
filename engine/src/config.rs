use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{APP_NAME, device::DevicePreference, llm::SamplingParams};

/// User settings shared by all workshop programs. Every field is optional in
/// the file, missing ones fall back to [`Config::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DevicePreference,
    /// Overrides the hugging face hub cache location.
    pub hub_cache_dir: Option<PathBuf>,
    /// Seed for the diffusion noise. Random when unset.
    pub seed: Option<u64>,
    pub speaker_embedding_path: Option<PathBuf>,
    pub text_generation: SamplingParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            hub_cache_dir: None,
            seed: None,
            speaker_embedding_path: None,
            text_generation: SamplingParams::default(),
        }
    }
}

impl Config {
    pub fn speaker_embedding_path(&self) -> Result<PathBuf> {
        match &self.speaker_embedding_path {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("speaker_embedding.safetensors")),
        }
    }
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .ok_or(eyre!("Couldn't find data dir"))?
        .join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(dirs::config_local_dir()
        .ok_or(eyre!("Couldn't get config dir"))?
        .join("genai_workshops.ron"))
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        Ok(Config::default())
    } else {
        load_ron_file(path).wrap_err_with(|| format!("reading config {}", path.display()))
    }
}

pub fn load_ron_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let src = fs::read_to_string(path)?;
    Ok(ron::from_str(&src)?)
}
