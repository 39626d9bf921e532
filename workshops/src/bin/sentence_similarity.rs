use clap::Parser;
use color_eyre::Result;
use genai_workshops::{
    Session,
    cli::SentenceSimilarity,
    similarity::{self, SENTENCES},
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();
    let args = SentenceSimilarity::parse();

    let session = Session::start(&args.common)?;
    let embedder = similarity::load_model(&session, &args.model).await?;
    let mut embeddings = Vec::with_capacity(SENTENCES.len());
    for sentence in SENTENCES {
        embeddings.push(embedder.embed(sentence).await?);
    }

    for line in similarity::similarity_lines(&SENTENCES, &embeddings)? {
        println!("{line}");
    }
    Ok(())
}
