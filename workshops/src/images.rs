use std::path::Path;

use color_eyre::Result;
use engine::{
    ModelError,
    device::default_dtype,
    image_model::{GenerationParams, Image, ImageModel, SdVersion, StableDiffusion, WeightsSource},
};
use log::info;

use crate::Session;

pub const TURBO_MODEL: &str = "stabilityai/sdxl-turbo";
pub const TURBO_PROMPT: &str =
    "A cinematic shot of a a cute panda a warrior, fantasy, intricate details, realistic";

pub const SDXL_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const SDXL_PROMPT: &str =
    "An astronaut riding a horse on Mars, high detail, 8k, cinematic lighting, photorealistic";

pub const SAFETENSORS_MODEL_PATH: &str = "./path/to/your/model.safetensors";
pub const SAFETENSORS_PROMPT: &str =
    "A majestic lion wearing a golden crown, hyper realistic, detailed, 8k";

pub const OUTPUT_IMAGE: &str = "output_image.png";
pub const GENERATED_IMAGE: &str = "generated_image.png";

pub fn turbo_params(seed: Option<u64>) -> GenerationParams {
    GenerationParams {
        steps: 1,
        guidance_scale: 0.0,
        width: 512,
        height: 512,
        seed,
    }
}

pub fn sdxl_params(seed: Option<u64>) -> GenerationParams {
    GenerationParams {
        steps: 25,
        guidance_scale: 7.5,
        width: 1024,
        height: 1024,
        seed,
    }
}

pub async fn load_from_hub(
    session: &Session,
    repo_id: &str,
    fallback: SdVersion,
) -> Result<StableDiffusion> {
    let version = SdVersion::detect_or(repo_id, fallback);
    StableDiffusion::load(
        &session.hub,
        WeightsSource::Hub(repo_id.to_string()),
        version,
        session.device.clone(),
        default_dtype(&session.device),
    )
    .await
}

/// Fails with [`ModelError::NotFound`] before touching the hub when `path`
/// doesn't exist.
pub async fn load_from_file(session: &Session, path: &Path) -> Result<StableDiffusion> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()).into());
    }
    let version = SdVersion::detect_file(path, SdVersion::Xl);
    StableDiffusion::load(
        &session.hub,
        WeightsSource::local(path),
        version,
        session.device.clone(),
        default_dtype(&session.device),
    )
    .await
}

/// One pipeline call, the result goes to `output`.
pub async fn generate(
    model: &dyn ImageModel,
    prompt: &str,
    params: &GenerationParams,
    output: &Path,
) -> Result<Image> {
    info!("{} with {params:?}", model.version());
    let image = model.get_image(prompt, params).await?;
    image.save(output)?;
    Ok(image)
}

/// The local weights program from model path to saved image.
pub async fn generate_from_file(
    session: &Session,
    prompt: &str,
    model_path: &Path,
    output: &Path,
) -> Result<()> {
    let model = load_from_file(session, model_path).await?;
    let params = GenerationParams {
        seed: session.config.seed,
        ..GenerationParams::pipeline_defaults(model.version())
    };

    println!("Generating image with prompt: '{prompt}'...");
    generate(&model, prompt, &params, output).await?;
    println!("Image successfully saved as '{}'", output.display());
    Ok(())
}
