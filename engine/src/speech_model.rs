use std::{path::Path, pin::Pin};

use candle_core::Tensor;
use color_eyre::{Result, eyre::WrapErr as _};

pub mod metavoice;
pub mod speaker_embedding;

pub use metavoice::MetaVoice;

/// Peak level [`Speech::normalize`] scales to.
const NORMALIZED_PEAK: f32 = 0.95;

/// Mono audio with samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Speech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Speech {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn normalize(&mut self) {
        let peak = self.samples.iter().fold(0f32, |acc, s| acc.max(s.abs()));
        if peak > 0.0 {
            let gain = NORMALIZED_PEAK / peak;
            self.samples.iter_mut().for_each(|s| *s *= gain);
        }
    }

    /// 16 bit PCM, out of range samples are clipped.
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .wrap_err_with(|| format!("creating {}", path.display()))?;
        for sample in &self.samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

pub trait SpeechModel {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        speaker: &'a Tensor,
    ) -> Pin<Box<dyn Future<Output = Result<Speech>> + Send + 'a>>;

    fn sample_rate(&self) -> u32;
}
