use std::{
    path::{Path, PathBuf},
    pin::Pin,
};

use candle_core::{DType, Tensor};
use color_eyre::{
    Result,
    eyre::{WrapErr as _, eyre},
};
use log::warn;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

pub mod stable_diffusion;
pub use stable_diffusion::StableDiffusion;

#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    clap::ValueEnum,
    Serialize,
    Deserialize,
    Hash,
    PartialEq,
    Eq,
    EnumIter,
)]
pub enum SdVersion {
    #[strum(to_string = "Stable Diffusion 1.5")]
    V1_5,
    #[strum(to_string = "Stable Diffusion 2.1")]
    V2_1,
    #[strum(to_string = "Stable Diffusion XL")]
    Xl,
    #[strum(to_string = "SDXL Turbo")]
    Turbo,
}

impl SdVersion {
    /// Guesses the architecture from a hub repository id or a file name.
    pub fn detect(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("turbo") {
            Some(SdVersion::Turbo)
        } else if name.contains("xl") {
            Some(SdVersion::Xl)
        } else if name.contains("2-1") || name.contains("2.1") {
            Some(SdVersion::V2_1)
        } else if ["1-5", "1.5", "sd15", "v15"].iter().any(|m| name.contains(m)) {
            Some(SdVersion::V1_5)
        } else {
            None
        }
    }

    /// [`SdVersion::detect`], falling back to `fallback` with a warning.
    pub fn detect_or(name: &str, fallback: SdVersion) -> Self {
        Self::detect(name).unwrap_or_else(|| {
            warn!("Can't tell the architecture of {name}, assuming {fallback}");
            fallback
        })
    }

    /// [`SdVersion::detect_or`] on the file name only, so directory names
    /// don't leak into the guess.
    pub fn detect_file(path: &Path, fallback: SdVersion) -> Self {
        match path.file_name() {
            Some(name) => Self::detect_or(&name.to_string_lossy(), fallback),
            None => Self::detect_or(&path.to_string_lossy(), fallback),
        }
    }

    pub fn default_repo(&self) -> &'static str {
        match self {
            SdVersion::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
            SdVersion::V2_1 => "stabilityai/stable-diffusion-2-1",
            SdVersion::Xl => "stabilityai/stable-diffusion-xl-base-1.0",
            SdVersion::Turbo => "stabilityai/sdxl-turbo",
        }
    }

    /// (width, height) the model was trained at.
    pub fn native_size(&self) -> (usize, usize) {
        match self {
            SdVersion::V1_5 | SdVersion::Turbo => (512, 512),
            SdVersion::V2_1 => (768, 768),
            SdVersion::Xl => (1024, 1024),
        }
    }

    pub fn is_xl(&self) -> bool {
        matches!(self, SdVersion::Xl | SdVersion::Turbo)
    }

    /// Scaling factor of the VAE latent space.
    pub fn vae_scale(&self) -> f64 {
        if self.is_xl() { 0.13025 } else { 0.18215 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

impl GenerationParams {
    /// What the pipeline does when called with nothing but a prompt.
    pub fn pipeline_defaults(version: SdVersion) -> Self {
        let (width, height) = version.native_size();
        let (steps, guidance_scale) = match version {
            SdVersion::V1_5 | SdVersion::V2_1 => (50, 7.5),
            SdVersion::Xl => (50, 5.0),
            SdVersion::Turbo => (1, 0.0),
        };
        Self {
            steps,
            guidance_scale,
            width,
            height,
            seed: None,
        }
    }

    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

/// Where the diffusion weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
    Hub(String),
    /// A diffusers style directory with `unet/`, `vae/`, `text_encoder/` ...
    LocalDir(PathBuf),
    /// Only the UNet, everything else comes from the default repo.
    UnetFile(PathBuf),
}

impl WeightsSource {
    /// Local paths become [`WeightsSource::LocalDir`] or
    /// [`WeightsSource::UnetFile`], anything else is taken as a repo id.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            WeightsSource::LocalDir(path)
        } else {
            WeightsSource::UnetFile(path)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    pub rgb: image::RgbImage,
}

impl Image {
    /// Expects a `(3, height, width)` u8 tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (channels, height, width) = tensor.dims3()?;
        if channels != 3 {
            return Err(eyre!("expected 3 channels, got {channels}"));
        }

        let pixels = tensor
            .to_dtype(DType::U8)?
            .permute((1, 2, 0))?
            .flatten_all()?
            .to_vec1::<u8>()?;

        let rgb = image::RgbImage::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| eyre!("pixel buffer doesn't match {width}x{height}"))?;
        Ok(Self { rgb })
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// Format follows the file extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.rgb
            .save(path)
            .wrap_err_with(|| format!("saving image to {}", path.display()))
    }
}

pub trait ImageModel {
    fn get_image<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
    ) -> Pin<Box<dyn Future<Output = Result<Image>> + Send + 'a>>;

    fn version(&self) -> SdVersion;
}
