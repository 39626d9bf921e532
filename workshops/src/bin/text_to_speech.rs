use std::path::Path;

use clap::Parser;
use color_eyre::Result;
use genai_workshops::{
    Session,
    cli::TextToSpeech,
    speech::{self, OUTPUT_WAV},
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();
    let args = TextToSpeech::parse();

    let session = Session::start(&args.common)?;
    let speaker = speech::speaker(&session)?;
    let model = speech::load_model(&session, &args.model).await?;
    speech::speak(&model, &args.text, &speaker, Path::new(OUTPUT_WAV)).await?;
    Ok(())
}
