use std::path::Path;

use candle_core::Tensor;
use color_eyre::Result;
use engine::speech_model::{MetaVoice, Speech, SpeechModel, metavoice, speaker_embedding};
use log::info;

use crate::Session;

pub const DEFAULT_MODEL: &str = metavoice::DEFAULT_REPO;
pub const DEFAULT_TEXT: &str = "Hi, I am a robot, nice to meet you.";
pub const OUTPUT_WAV: &str = "output.wav";

pub async fn load_model(session: &Session, repo_id: &str) -> Result<MetaVoice> {
    let seed = session.config.seed.unwrap_or(metavoice::DEFAULT_SEED);
    MetaVoice::load(&session.hub, repo_id, session.device.clone(), seed).await
}

/// The cached speaker embedding from the configured location.
pub fn speaker(session: &Session) -> Result<Tensor> {
    let path = session.config.speaker_embedding_path()?;
    speaker_embedding::load_or_create(&path, speaker_embedding::DEFAULT_SEED, &session.device)
}

pub async fn speak(
    model: &dyn SpeechModel,
    text: &str,
    speaker: &Tensor,
    output: &Path,
) -> Result<Speech> {
    let speech = model.synthesize(text, speaker).await?;
    info!(
        "{:.1}s of audio at {} Hz",
        speech.duration_secs(),
        speech.sample_rate
    );
    speech.write_wav(output)?;
    Ok(speech)
}

#[cfg(test)]
mod tests {
    use std::{pin::Pin, sync::Mutex};

    use candle_core::Device;
    use tempfile::tempdir;

    use super::*;

    #[derive(Default)]
    struct RecordingVoice {
        calls: Mutex<Vec<(String, Vec<Vec<f32>>)>>,
    }

    impl SpeechModel for RecordingVoice {
        fn synthesize<'a>(
            &'a self,
            text: &'a str,
            speaker: &'a Tensor,
        ) -> Pin<Box<dyn Future<Output = Result<Speech>> + Send + 'a>> {
            Box::pin(async move {
                let speaker = speaker.to_vec2::<f32>()?;
                self.calls.lock().unwrap().push((text.to_string(), speaker));
                Ok(Speech {
                    samples: vec![0.0, 0.5, -0.5, 0.0],
                    sample_rate: self.sample_rate(),
                })
            })
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    #[tokio::test]
    async fn speaks_text_with_cached_speaker() -> Result<()> {
        let dir = tempdir()?;
        let embedding_path = dir.path().join("speaker_embedding.safetensors");
        let output = dir.path().join(OUTPUT_WAV);
        let voice = RecordingVoice::default();

        let speaker = speaker_embedding::load_or_create(&embedding_path, 0, &Device::Cpu)?;
        speak(&voice, DEFAULT_TEXT, &speaker, &output).await?;

        // Second run reuses the cached file.
        let cached = std::fs::read(&embedding_path)?;
        let again = speaker_embedding::load_or_create(&embedding_path, 0, &Device::Cpu)?;
        assert_eq!(std::fs::read(&embedding_path)?, cached);

        let calls = voice.calls.lock().unwrap();
        assert_eq!(calls[0].0, DEFAULT_TEXT);
        assert_eq!(calls[0].1, again.to_vec2::<f32>()?);

        let reader = hound::WavReader::open(&output)?;
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.len(), 4);
        Ok(())
    }
}
