//! VITS text-to-speech engine implementation.
//!
//! Speech is produced in three stages per call:
//!
//! 1. **Phonemization**: libespeak-ng, loaded at runtime, traces IPA phonemes
//!    for the input text into a call-scoped C stream (see [`channel`]). The
//!    output is cleaned up and split into one transcription per sentence.
//! 2. **Encoding**: each transcription becomes token IDs via a fixed phoneme
//!    table: `BOS + (ids + PAD)* + EOS`.
//! 3. **Synthesis**: one ONNX forward pass per sentence; the waveforms are
//!    concatenated in sentence order.
//!
//! # System Requirements
//!
//! The **libespeak-ng** shared library must be loadable:
//! - **Linux**: `sudo apt-get install libespeak-ng1` (`libespeak-ng.so.1`)
//! - **macOS**: `brew install espeak-ng`
//! - **Windows**: install from <https://espeak-ng.org/download> and point
//!   [`VitsModelParams::espeak_library_dir`] at the directory holding
//!   `libespeak-ng.dll`
//!
//! # Model Layout
//!
//! ```text
//! models/
//! ├── glados.onnx        # VITS model (Piper export), 22050 Hz mono
//! └── glados.onnx.json   # optional: phoneme_id_map, sample rate, voice, scales
//! ```
//!
//! Without the `.onnx.json` the built-in phoneme table, 22050 Hz and the
//! `en-us` voice are used.
//!
//! # Examples
//!
//! ```rust,no_run
//! use vits_tts::{SynthesisEngine, engines::vits::{VitsEngine, InferenceParams}};
//! use std::path::PathBuf;
//!
//! let mut engine = VitsEngine::new();
//! engine.load_model(&PathBuf::from("models/glados.onnx"))?;
//!
//! let params = InferenceParams {
//!     length_scale: 1.1,
//!     ..Default::default()
//! };
//! engine.synthesize_to_file(
//!     "Hello world. How are you?",
//!     &PathBuf::from("out.wav"),
//!     Some(params),
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod espeak;
pub mod model;
pub mod phonemizer;
pub mod pipeline;
pub mod vocab;

pub use encoder::TokenEncoder;
pub use engine::{VitsEngine, VitsModelParams};
pub use model::{AcousticModel, AcousticSynthesizer, InferenceParams, VitsError, SAMPLE_RATE};
pub use phonemizer::{Extraction, PhonemeExtractor, Phonemize};
pub use pipeline::{
    PipelineConfig, PipelineConfigBuilder, SentenceFailurePolicy, SpeechPipeline, Utterance,
};
pub use vocab::PhonemeIdMap;
