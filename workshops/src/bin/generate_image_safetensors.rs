use std::{path::Path, process::ExitCode};

use clap::Parser;
use color_eyre::Result;
use genai_workshops::{
    Session,
    cli::GenerateImageSafetensors,
    describe_failure,
    images::{self, GENERATED_IMAGE},
};

async fn run(args: &GenerateImageSafetensors) -> Result<()> {
    let session = Session::start(&args.common)?;
    let output = Path::new(GENERATED_IMAGE);
    images::generate_from_file(&session, &args.prompt, &args.model_path, output).await
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("{e:?}");
    }
    pretty_env_logger::init();
    let args = GenerateImageSafetensors::parse();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            for line in describe_failure(&report) {
                println!("{line}");
            }
            ExitCode::FAILURE
        }
    }
}
