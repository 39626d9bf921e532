use std::path::Path;

use clap::Parser;
use color_eyre::Result;
use engine::image_model::SdVersion;
use genai_workshops::{
    Session,
    cli::GenerateImageSdxl,
    images::{self, OUTPUT_IMAGE},
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();
    let args = GenerateImageSdxl::parse();

    let session = Session::start(&args.common)?;
    let model = images::load_from_hub(&session, &args.model, SdVersion::Xl).await?;
    let params = images::sdxl_params(session.config.seed);
    images::generate(&model, &args.prompt, &params, Path::new(OUTPUT_IMAGE)).await?;

    println!("Image saved as {OUTPUT_IMAGE}");
    Ok(())
}
