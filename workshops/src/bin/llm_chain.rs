use std::io::stdout;

use clap::Parser;
use color_eyre::Result;
use genai_workshops::{
    Session,
    cli::LlmChain,
    text::{self, MAX_NEW_TOKENS},
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();
    let args = LlmChain::parse();

    let session = Session::start(&args.common)?;
    let llm = text::load_model(&session, &args.model).await?;
    text::answer(llm, &args.question, MAX_NEW_TOKENS, &mut stdout()).await?;
    Ok(())
}
