use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::{SynthesisEngine, SynthesisResult};

use super::config::VoiceConfig;
use super::encoder::TokenEncoder;
use super::model::{find_onnx_file, AcousticSynthesizer, InferenceParams, VitsError};
use super::phonemizer::{PhonemeExtractor, DEFAULT_PHONEMIZE_TIMEOUT};
use super::pipeline::{PipelineConfig, SentenceFailurePolicy, SpeechPipeline, Utterance};

/// Parameters for configuring VITS model loading.
#[derive(Debug, Clone)]
pub struct VitsModelParams {
    /// Prefer the CUDA execution provider (falls back to CPU).
    pub use_cuda: bool,
    /// Number of CPU threads to use for inference.
    /// `None` uses the ORT default (typically all available cores).
    pub num_threads: Option<usize>,
    /// Directory holding the platform-named libespeak-ng shared library.
    /// `None` searches the dynamic loader path.
    pub espeak_library_dir: Option<PathBuf>,
    /// Directory containing `espeak-ng-data`. `None` uses the library default.
    pub espeak_data_dir: Option<PathBuf>,
    /// espeak-ng voice. `None` uses the voice config, then `en-us`.
    pub voice: Option<String>,
    /// Upper bound on one phonemization call.
    pub phonemize_timeout: Duration,
    /// Behaviour when a single sentence fails to synthesize.
    pub on_sentence_error: SentenceFailurePolicy,
    /// Run sentences on scoped threads. The ONNX session still runs one
    /// forward pass at a time.
    pub parallel: bool,
}

impl Default for VitsModelParams {
    fn default() -> Self {
        Self {
            use_cuda: false,
            num_threads: None,
            espeak_library_dir: None,
            espeak_data_dir: None,
            voice: None,
            phonemize_timeout: DEFAULT_PHONEMIZE_TIMEOUT,
            on_sentence_error: SentenceFailurePolicy::Abort,
            parallel: false,
        }
    }
}

/// VITS text-to-speech engine.
///
/// Phonemizes with libespeak-ng (loaded at runtime) and synthesizes each
/// sentence with one forward pass of a Piper-style VITS ONNX model.
///
/// # Quick Start
///
/// ```rust,no_run
/// use vits_tts::{SynthesisEngine, engines::vits::VitsEngine};
/// use std::path::PathBuf;
///
/// let mut engine = VitsEngine::new();
/// engine.load_model(&PathBuf::from("models/glados.onnx"))?;
/// let result = engine.synthesize("Hello world. How are you?", None)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Bundled espeak-ng
///
/// ```rust,no_run
/// use vits_tts::{SynthesisEngine, engines::vits::{VitsEngine, VitsModelParams}};
/// use std::path::PathBuf;
///
/// let mut engine = VitsEngine::new();
/// let params = VitsModelParams {
///     espeak_library_dir: Some(PathBuf::from("/app/resources/espeak-ng")),
///     espeak_data_dir: Some(PathBuf::from("/app/resources/espeak-ng-data")),
///     ..Default::default()
/// };
/// engine.load_model_with_params(&PathBuf::from("models/glados.onnx"), params)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct VitsEngine {
    pipeline: Option<SpeechPipeline<PhonemeExtractor, AcousticSynthesizer>>,
    model_path: Option<PathBuf>,
}

impl Default for VitsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl VitsEngine {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            model_path: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Synthesize and keep the per-sentence breakdown and warnings.
    pub fn generate_utterance(
        &self,
        text: &str,
        params: Option<InferenceParams>,
    ) -> Result<Utterance, VitsError> {
        let pipeline = self.pipeline.as_ref().ok_or(VitsError::ModelNotLoaded)?;
        match params {
            Some(p) => pipeline.generate_with(text, &p),
            None => pipeline.generate(text),
        }
    }
}

impl Drop for VitsEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}

impl SynthesisEngine for VitsEngine {
    type SynthesisParams = InferenceParams;
    type ModelParams = VitsModelParams;

    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        // Release the previous espeak-ng handle and session first. A failed
        // reload leaves the engine unloaded.
        self.unload_model();

        let onnx_path = find_onnx_file(model_path)?;
        let voice_config = VoiceConfig::for_model(&onnx_path)?.unwrap_or_else(|| {
            log::warn!("No voice config beside model, using hardcoded phoneme table");
            VoiceConfig::default()
        });

        let vocab = Arc::new(voice_config.phoneme_id_map()?);
        let voice = params
            .voice
            .as_deref()
            .or(voice_config.espeak.voice.as_deref());

        let phonemizer = PhonemeExtractor::new(
            params.espeak_library_dir.as_deref(),
            params.espeak_data_dir.as_deref(),
            voice,
            params.phonemize_timeout,
        )?;
        let model = AcousticSynthesizer::load(
            &onnx_path,
            params.use_cuda,
            params.num_threads,
            &voice_config,
        )?;

        let config = PipelineConfig {
            inference: voice_config.inference_defaults(),
            on_sentence_error: params.on_sentence_error,
            parallel: params.parallel,
            max_threads: None,
        };
        log::info!(
            "VITS engine ready: {} phoneme symbols, {} Hz",
            vocab.len(),
            voice_config.sample_rate()
        );

        self.pipeline = Some(SpeechPipeline::new(
            phonemizer,
            TokenEncoder::new(vocab),
            model,
            config,
        ));
        self.model_path = Some(onnx_path);
        Ok(())
    }

    fn unload_model(&mut self) {
        self.pipeline = None;
        self.model_path = None;
    }

    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>> {
        let utterance = self.generate_utterance(text, params)?;
        for warning in &utterance.warnings {
            log::warn!("Synthesis degraded: {warning}");
        }
        Ok(utterance.audio)
    }
}
