use std::path::PathBuf;

use engine::device::DevicePreference;

use crate::{images, similarity, speech, text};

/// Flags shared by every program. Both override the config file.
#[derive(Debug, Default, clap::Args)]
pub struct Common {
    #[arg(long, value_enum)]
    pub device: Option<DevicePreference>,

    #[arg(long)]
    pub seed: Option<u64>,
}

/// Text to image in a single step with SDXL Turbo.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct GenerateImage {
    #[arg(default_value = images::TURBO_PROMPT)]
    pub prompt: String,

    /// Hugging Face repository id.
    #[arg(default_value = images::TURBO_MODEL)]
    pub model: String,

    #[command(flatten)]
    pub common: Common,
}

/// Text to image with the SDXL base model.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct GenerateImageSdxl {
    #[arg(default_value = images::SDXL_PROMPT)]
    pub prompt: String,

    /// Hugging Face repository id.
    #[arg(default_value = images::SDXL_MODEL)]
    pub model: String,

    #[command(flatten)]
    pub common: Common,
}

/// Text to image from local weights.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct GenerateImageSafetensors {
    #[arg(default_value = images::SAFETENSORS_PROMPT)]
    pub prompt: String,

    /// A UNet `.safetensors` file or a diffusers model directory.
    #[arg(default_value = images::SAFETENSORS_MODEL_PATH)]
    pub model_path: PathBuf,

    #[command(flatten)]
    pub common: Common,
}

/// Answers a question with a local language model.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct LlmChain {
    #[arg(default_value = text::DEFAULT_QUESTION)]
    pub question: String,

    /// Hugging Face repository id of a Qwen2 style model.
    #[arg(default_value = text::DEFAULT_MODEL)]
    pub model: String,

    #[command(flatten)]
    pub common: Common,
}

/// Reads a sentence out loud into a WAV file.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct TextToSpeech {
    #[arg(default_value = speech::DEFAULT_TEXT)]
    pub text: String,

    #[arg(default_value = speech::DEFAULT_MODEL)]
    pub model: String,

    #[command(flatten)]
    pub common: Common,
}

/// Compares a few sentences by their embeddings.
#[derive(Debug, clap::Parser)]
#[command(version)]
pub struct SentenceSimilarity {
    #[arg(default_value = similarity::DEFAULT_MODEL)]
    pub model: String,

    #[command(flatten)]
    pub common: Common,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_without_arguments() -> color_eyre::Result<()> {
        let args = GenerateImage::try_parse_from(["generate_image"])?;
        assert_eq!(
            args.prompt,
            "A cinematic shot of a a cute panda a warrior, fantasy, intricate details, realistic"
        );
        assert_eq!(args.model, "stabilityai/sdxl-turbo");
        assert_eq!(args.common.device, None);

        let args = GenerateImageSdxl::try_parse_from(["generate_image_sdxl"])?;
        assert_eq!(
            args.prompt,
            "An astronaut riding a horse on Mars, high detail, 8k, cinematic lighting, photorealistic"
        );
        assert_eq!(args.model, "stabilityai/stable-diffusion-xl-base-1.0");

        let args = GenerateImageSafetensors::try_parse_from(["generate_image_safetensors"])?;
        assert_eq!(
            args.prompt,
            "A majestic lion wearing a golden crown, hyper realistic, detailed, 8k"
        );
        assert_eq!(
            args.model_path,
            PathBuf::from("./path/to/your/model.safetensors")
        );

        let args = LlmChain::try_parse_from(["llm_chain"])?;
        assert_eq!(
            args.question,
            "What are the three most important things to consider when running a local LLM?"
        );
        assert_eq!(args.model, "Qwen/Qwen2.5-0.5B-Instruct");

        let args = TextToSpeech::try_parse_from(["text_to_speech"])?;
        assert_eq!(args.text, "Hi, I am a robot, nice to meet you.");
        assert_eq!(args.model, "lmz/candle-metavoice");

        let args = SentenceSimilarity::try_parse_from(["sentence_similarity"])?;
        assert_eq!(args.model, "sentence-transformers/all-MiniLM-L6-v2");
        Ok(())
    }

    #[test]
    fn positionals_and_flags() -> color_eyre::Result<()> {
        let args = GenerateImage::try_parse_from([
            "generate_image",
            "  a red  fox ",
            "my/turbo",
            "--device",
            "cpu",
            "--seed",
            "7",
        ])?;
        assert_eq!(args.prompt, "  a red  fox ");
        assert_eq!(args.model, "my/turbo");
        assert_eq!(args.common.device, Some(DevicePreference::Cpu));
        assert_eq!(args.common.seed, Some(7));

        let args = GenerateImageSdxl::try_parse_from(["generate_image_sdxl", "only a prompt"])?;
        assert_eq!(args.prompt, "only a prompt");
        assert_eq!(args.model, images::SDXL_MODEL);
        Ok(())
    }

    #[test]
    fn too_many_arguments() {
        assert!(LlmChain::try_parse_from(["llm_chain", "q", "m", "extra"]).is_err());
    }
}
