use std::{
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use color_eyre::{
    Result,
    eyre::{ensure, eyre},
};
use log::{debug, info, warn};
use tokenizers::Tokenizer;

use super::{GenerationParams, Image, ImageModel, SdVersion, WeightsSource};
use crate::{
    ModelError,
    hub::Hub,
    random::{fresh_seed, seeded_normal},
};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const SDXL_FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

/// Text-to-image pipeline: CLIP text encoder(s), UNet denoiser and VAE decoder.
#[derive(Clone)]
pub struct StableDiffusion {
    inner: Arc<Pipeline>,
}

struct Pipeline {
    version: SdVersion,
    tokenizers: Vec<Tokenizer>,
    text_encoders: Vec<clip::ClipTextTransformer>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
}

/// Local paths of everything the pipeline needs.
#[derive(Debug)]
struct ComponentFiles {
    tokenizers: Vec<PathBuf>,
    text_encoders: Vec<PathBuf>,
    unet: PathBuf,
    vae: PathBuf,
}

impl StableDiffusion {
    pub async fn load(
        hub: &Hub,
        source: WeightsSource,
        version: SdVersion,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let files = ComponentFiles::resolve(hub, &source, version, dtype).await?;
        debug!("Pipeline files: {files:#?}");

        info!("Loading {version} pipeline from {source:?}");
        let pipeline =
            tokio::task::spawn_blocking(move || Pipeline::build(files, version, device, dtype))
                .await??;

        Ok(Self {
            inner: Arc::new(pipeline),
        })
    }
}

impl ImageModel for StableDiffusion {
    fn get_image<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
    ) -> Pin<Box<dyn Future<Output = Result<Image>> + Send + 'a>> {
        let pipeline = Arc::clone(&self.inner);
        let prompt = prompt.to_string();
        let params = params.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || pipeline.generate(&prompt, &params)).await?
        })
    }

    fn version(&self) -> SdVersion {
        self.inner.version
    }
}

impl ComponentFiles {
    async fn resolve(
        hub: &Hub,
        source: &WeightsSource,
        version: SdVersion,
        dtype: DType,
    ) -> Result<Self> {
        match source {
            WeightsSource::LocalDir(path) => ensure_exists(path)?,
            WeightsSource::UnetFile(path) => {
                ensure_exists(path)?;
                ensure_diffusers_unet(path)?;
            }
            WeightsSource::Hub(_) => {}
        }

        let mut tokenizers = vec![hub.model(CLIP_TOKENIZER_REPO).get("tokenizer.json").await?];
        if version.is_xl() {
            tokenizers.push(hub.model(CLIP2_TOKENIZER_REPO).get("tokenizer.json").await?);
        }

        match source {
            WeightsSource::Hub(repo_id) => {
                Self::from_hub(hub, repo_id, version, dtype, tokenizers, None).await
            }

            WeightsSource::LocalDir(dir) => {
                let text_encoders = encoder_dirs(version)
                    .iter()
                    .map(|d| existing(dir.join(d).join("model.safetensors")))
                    .collect::<Result<Vec<_>>>()?;

                Ok(Self {
                    tokenizers,
                    text_encoders,
                    unet: existing(dir.join("unet/diffusion_pytorch_model.safetensors"))?,
                    vae: existing(dir.join("vae/diffusion_pytorch_model.safetensors"))?,
                })
            }

            WeightsSource::UnetFile(unet) => {
                let repo_id = version.default_repo();
                Self::from_hub(hub, repo_id, version, dtype, tokenizers, Some(unet.clone())).await
            }
        }
    }

    async fn from_hub(
        hub: &Hub,
        repo_id: &str,
        version: SdVersion,
        dtype: DType,
        tokenizers: Vec<PathBuf>,
        local_unet: Option<PathBuf>,
    ) -> Result<Self> {
        let repo = hub.model(repo_id);
        let variant = if dtype == DType::F16 { ".fp16" } else { "" };

        let mut text_encoders = vec![];
        for dir in encoder_dirs(version) {
            text_encoders.push(repo.get(&format!("{dir}/model{variant}.safetensors")).await?);
        }
        let unet = match local_unet {
            Some(path) => path,
            None => {
                repo.get(&format!("unet/diffusion_pytorch_model{variant}.safetensors"))
                    .await?
            }
        };
        let vae = if version.is_xl() && dtype == DType::F16 {
            // the stock SDXL VAE overflows in f16
            hub.model(SDXL_FP16_VAE_REPO)
                .get("diffusion_pytorch_model.safetensors")
                .await?
        } else {
            repo.get(&format!("vae/diffusion_pytorch_model{variant}.safetensors"))
                .await?
        };

        Ok(Self {
            tokenizers,
            text_encoders,
            unet,
            vae,
        })
    }
}

fn encoder_dirs(version: SdVersion) -> &'static [&'static str] {
    if version.is_xl() {
        &["text_encoder", "text_encoder_2"]
    } else {
        &["text_encoder"]
    }
}

fn ensure_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()).into());
    }
    Ok(())
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    ensure_exists(&path)?;
    Ok(path)
}

/// Prefix of the UNet tensors in original (LDM) single-file checkpoints.
const LDM_UNET_PREFIX: &str = "model.diffusion_model.";

/// Single-file checkpoints bundle UNet, VAE and text encoder under LDM names,
/// which the diffusers UNet loader can't read.
fn ensure_diffusers_unet(path: &Path) -> Result<()> {
    let weights = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
    let is_ldm = weights
        .tensors()
        .iter()
        .any(|(name, _)| name.starts_with(LDM_UNET_PREFIX));
    if is_ldm {
        return Err(ModelError::SingleFileCheckpoint(path.to_path_buf()).into());
    }
    Ok(())
}

pub fn sd_config(version: SdVersion, width: usize, height: usize) -> StableDiffusionConfig {
    let (width, height) = (Some(width), Some(height));
    match version {
        SdVersion::V1_5 => StableDiffusionConfig::v1_5(None, height, width),
        SdVersion::V2_1 => StableDiffusionConfig::v2_1(None, height, width),
        SdVersion::Xl => StableDiffusionConfig::sdxl(None, height, width),
        SdVersion::Turbo => StableDiffusionConfig::sdxl_turbo(None, height, width),
    }
}

fn clip_config(sd_config: &StableDiffusionConfig, index: usize) -> Result<&clip::Config> {
    match index {
        0 => Ok(&sd_config.clip),
        1 => sd_config
            .clip2
            .as_ref()
            .ok_or_else(|| eyre!("pipeline has no second text encoder")),
        _ => Err(eyre!("no text encoder #{index}")),
    }
}

impl Pipeline {
    fn build(files: ComponentFiles, version: SdVersion, device: Device, dtype: DType) -> Result<Self> {
        let (width, height) = version.native_size();
        let config = sd_config(version, width, height);

        let tokenizers = files
            .tokenizers
            .iter()
            .map(|p| Tokenizer::from_file(p).map_err(ModelError::tokenizer))
            .collect::<Result<Vec<_>, _>>()?;

        let mut text_encoders = vec![];
        for (i, weights) in files.text_encoders.iter().enumerate() {
            // clip always runs in f32, only its output is cast
            text_encoders.push(stable_diffusion::build_clip_transformer(
                clip_config(&config, i)?,
                weights,
                &device,
                DType::F32,
            )?);
        }

        let unet = config.build_unet(&files.unet, &device, 4, false, dtype)?;
        let vae = config.build_vae(&files.vae, &device, dtype)?;

        Ok(Self {
            version,
            tokenizers,
            text_encoders,
            unet,
            vae,
            device,
            dtype,
        })
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Image> {
        ensure!(
            params.width % 8 == 0 && params.height % 8 == 0,
            "width and height must be multiples of 8, got {}x{}",
            params.width,
            params.height
        );
        ensure!(params.steps > 0, "at least one inference step is needed");

        let config = sd_config(self.version, params.width, params.height);
        let use_guidance = params.uses_guidance();
        let text_embeddings = self.encode_prompt(&config, prompt, use_guidance)?;

        let mut scheduler = config.build_scheduler(params.steps)?;
        let seed = params.seed.unwrap_or_else(fresh_seed);
        info!("Sampling {} steps with seed {seed}", params.steps);

        let latents = seeded_normal(
            seed,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (i, &timestep) in timesteps.iter().enumerate() {
            debug!("step {}/{} (t={timestep})", i + 1, timesteps.len());
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = self.vae.decode(&(&latents / self.version.vae_scale())?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1f32)? * 255.)?
            .to_dtype(DType::U8)?
            .i(0)?;

        Image::from_tensor(&image)
    }

    /// Embeddings of all text encoders concatenated on the feature axis. With
    /// guidance the batch is `[unconditional, conditional]`.
    fn encode_prompt(
        &self,
        config: &StableDiffusionConfig,
        prompt: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let mut embeddings = vec![];
        for (i, (tokenizer, encoder)) in self.tokenizers.iter().zip(&self.text_encoders).enumerate() {
            let clip_config = clip_config(config, i)?;
            let tokens = clip_tokens(tokenizer, prompt, clip_config, &self.device)?;
            let cond = encoder.forward(&tokens)?;

            let embedding = if use_guidance {
                let uncond_tokens = clip_tokens(tokenizer, "", clip_config, &self.device)?;
                let uncond = encoder.forward(&uncond_tokens)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(embedding.to_dtype(self.dtype)?);
        }

        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }
}

/// Token ids padded (or truncated) to the clip context length, shape `(1, len)`.
fn clip_tokens(
    tokenizer: &Tokenizer,
    text: &str,
    config: &clip::Config,
    device: &Device,
) -> Result<Tensor> {
    let ids = pad_to_context(tokenizer, text, config.max_position_embeddings, config.pad_with.as_deref())?;
    Ok(Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?)
}

fn pad_to_context(
    tokenizer: &Tokenizer,
    text: &str,
    context_len: usize,
    pad_with: Option<&str>,
) -> Result<Vec<u32>> {
    let pad_token = pad_with.unwrap_or("<|endoftext|>");
    let pad_id = tokenizer
        .token_to_id(pad_token)
        .ok_or_else(|| eyre!("tokenizer has no {pad_token} token"))?;

    let mut ids = tokenizer
        .encode(text, true)
        .map_err(ModelError::tokenizer)?
        .get_ids()
        .to_vec();

    if ids.len() > context_len {
        warn!(
            "Prompt is {} tokens long, only the first {context_len} are used",
            ids.len()
        );
        ids.truncate(context_len);
    }
    ids.resize(context_len, pad_id);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, path::Path};

    use tempfile::tempdir;

    use super::*;
    use crate::{config::Config, testing};

    fn write_weights(path: &Path, names: &[&str]) -> Result<()> {
        let tensors: HashMap<String, Tensor> = names
            .iter()
            .map(|n| Ok((n.to_string(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?)))
            .collect::<Result<_>>()?;
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Lays `files` out the way the hub client caches them, so `get` never
    /// goes to the network.
    fn seed_hub_cache(cache: &Path, repo_id: &str, files: &[&str]) -> Result<()> {
        let repo_dir = cache.join(format!("models--{}", repo_id.replace('/', "--")));
        let commit = "0123456789abcdef";
        fs::create_dir_all(repo_dir.join("refs"))?;
        fs::write(repo_dir.join("refs/main"), commit)?;
        for file in files {
            let path = repo_dir.join("snapshots").join(commit).join(file);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, b"")?;
        }
        Ok(())
    }

    fn word_tokenizer() -> Tokenizer {
        testing::word_tokenizer(&["<|endoftext|>", "!", "a", "panda"])
    }

    #[test]
    fn pads_with_end_of_text_by_default() -> Result<()> {
        let ids = pad_to_context(&word_tokenizer(), "a panda", 5, None)?;
        assert_eq!(ids, vec![2, 3, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn pads_with_configured_token() -> Result<()> {
        let ids = pad_to_context(&word_tokenizer(), "panda", 3, Some("!"))?;
        assert_eq!(ids, vec![3, 1, 1]);
        Ok(())
    }

    #[test]
    fn long_prompts_are_truncated() -> Result<()> {
        let ids = pad_to_context(&word_tokenizer(), "a panda a panda a panda", 4, None)?;
        assert_eq!(ids, vec![2, 3, 2, 3]);
        Ok(())
    }

    #[test]
    fn xl_configs_have_two_text_encoders() -> Result<()> {
        let xl = sd_config(SdVersion::Xl, 1024, 1024);
        assert!(clip_config(&xl, 1).is_ok());
        let v15 = sd_config(SdVersion::V1_5, 512, 512);
        assert!(clip_config(&v15, 1).is_err());
        assert_eq!(v15.width, 512);
        Ok(())
    }

    #[tokio::test]
    async fn missing_unet_file_is_not_found() -> Result<()> {
        let hub = Hub::new(&Default::default())?;
        let path = Path::new("./definitely/not/here.safetensors");
        let err = match StableDiffusion::load(
            &hub,
            WeightsSource::UnetFile(path.into()),
            SdVersion::Xl,
            Device::Cpu,
            DType::F32,
        )
        .await
        {
            Ok(_) => panic!("loading a missing file succeeded"),
            Err(err) => err,
        };

        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::NotFound(p)) if p == path
        ));
        Ok(())
    }

    #[tokio::test]
    async fn local_unet_is_not_downloaded() -> Result<()> {
        let dir = tempdir()?;
        let cache = dir.path().join("hub");
        let version = SdVersion::V1_5;
        seed_hub_cache(&cache, CLIP_TOKENIZER_REPO, &["tokenizer.json"])?;
        seed_hub_cache(
            &cache,
            version.default_repo(),
            &[
                "text_encoder/model.safetensors",
                "vae/diffusion_pytorch_model.safetensors",
            ],
        )?;
        let unet = dir.path().join("my_unet.safetensors");
        write_weights(&unet, &["conv_in.weight"])?;

        let hub = Hub::new(&Config {
            hub_cache_dir: Some(cache),
            ..Config::default()
        })?;
        let files = ComponentFiles::resolve(
            &hub,
            &WeightsSource::UnetFile(unet.clone()),
            version,
            DType::F32,
        )
        .await?;

        assert_eq!(files.unet, unet);
        assert_eq!(files.text_encoders.len(), 1);
        assert!(files.vae.ends_with("vae/diffusion_pytorch_model.safetensors"));
        Ok(())
    }

    #[tokio::test]
    async fn single_file_checkpoints_are_rejected_up_front() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("realisticVision.safetensors");
        write_weights(
            &path,
            &[
                "model.diffusion_model.input_blocks.0.0.weight",
                "first_stage_model.decoder.conv_in.weight",
            ],
        )?;

        let hub = Hub::new(&Config {
            hub_cache_dir: Some(dir.path().join("hub")),
            ..Config::default()
        })?;
        let err = match ComponentFiles::resolve(
            &hub,
            &WeightsSource::UnetFile(path.clone()),
            SdVersion::V1_5,
            DType::F32,
        )
        .await
        {
            Ok(files) => panic!("accepted a single-file checkpoint: {files:?}"),
            Err(err) => err,
        };

        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::SingleFileCheckpoint(p)) if *p == path
        ));
        Ok(())
    }

    #[test]
    fn diffusers_unet_passes_layout_check() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("unet.safetensors");
        write_weights(&path, &["conv_in.weight", "down_blocks.0.resnets.0.conv1.weight"])?;
        ensure_diffusers_unet(&path)
    }
}
