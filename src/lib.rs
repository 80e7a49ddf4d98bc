//! # vits-tts
//!
//! A Rust library providing text-to-speech synthesis with espeak-ng
//! phonemization and single-pass VITS acoustic models (Piper-style ONNX voices).
//!
//! ## Features
//!
//! - **VITS TTS**: espeak-ng IPA phonemes, a fixed phoneme-ID table and one
//!   ONNX forward pass per sentence
//! - **Sentence assembly**: per-sentence waveforms concatenated in order
//! - **Degrade, don't abort**: phonemization failures surface as warnings
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! vits-tts = { version = "2026.2", features = ["vits"] }
//! ```
//!
//! ```ignore
//! use std::path::PathBuf;
//! use vits_tts::{engines::vits::VitsEngine, SynthesisEngine};
//!
//! let mut engine = VitsEngine::new();
//! engine.load_model(&PathBuf::from("models/glados.onnx"))?;
//!
//! let result = engine.synthesize("Hello world. How are you?", None)?;
//! result.write_wav(&PathBuf::from("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engines;

use std::path::Path;

/// Full-scale amplitude used when converting float samples to 16-bit PCM.
pub const MAX_WAV_VALUE: f32 = 32767.0;

/// The result of a synthesis (text-to-speech) operation.
///
/// Contains raw f32 audio samples and the sample rate of the output audio.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    /// Raw mono audio samples as f32 values
    pub samples: Vec<f32>,
    /// Sample rate of the audio (22050 for the bundled VITS voices)
    pub sample_rate: u32,
}

impl SynthesisResult {
    /// An empty buffer at the given rate.
    pub fn silent(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Write the audio to a 16-bit PCM WAV file, the format most players expect.
    pub fn write_wav_pcm16(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for sample in self.to_pcm16() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Scale samples to 16-bit PCM, clamping anything outside [-1.0, 1.0].
    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * MAX_WAV_VALUE) as i16)
            .collect()
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// True when no samples were produced.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Common interface for text-to-speech synthesis engines.
///
/// This trait defines the standard operations that all synthesis engines must support.
/// Each engine may have different parameter types for model loading and inference configuration.
pub trait SynthesisEngine {
    /// Parameters for configuring inference behavior (speaker, prosody scales, etc.)
    type SynthesisParams;
    /// Parameters for configuring model loading (threads, execution provider, etc.)
    type ModelParams: Default;

    /// Load a model from the specified path using default parameters.
    fn load_model(&mut self, model_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.load_model_with_params(model_path, Self::ModelParams::default())
    }

    /// Load a model from the specified path with custom parameters.
    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Unload the currently loaded model and free associated resources.
    fn unload_model(&mut self);

    /// Synthesize speech from the given text.
    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>>;

    /// Synthesize speech from the given text and write to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `SynthesisResult::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        params: Option<Self::SynthesisParams>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.synthesize(text, params)?.write_wav(wav_path)
    }
}
