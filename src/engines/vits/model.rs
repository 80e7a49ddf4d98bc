use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::Array2;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use super::config::VoiceConfig;

/// Native output sample rate of the bundled GLaDOS voice.
pub const SAMPLE_RATE: u32 = 22050;

/// Model file preferred when a directory is given.
const DEFAULT_MODEL_FILE: &str = "glados.onnx";

#[derive(thiserror::Error, Debug)]
pub enum VitsError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error(
        "libespeak-ng not found. Install: Linux: `sudo apt-get install libespeak-ng1`, \
         macOS: `brew install espeak-ng`, Windows: https://espeak-ng.org/download"
    )]
    EspeakNotFound,
    #[error("Failed to load espeak-ng library {path}: {source}")]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("espeak_Initialize failed with code {0}")]
    EspeakInit(i32),
    #[error("espeak-ng voice '{voice}' could not be selected (code {code})")]
    VoiceNotSet { voice: String, code: i32 },
    #[error("Phonemization failed: {0}")]
    PhonemizerFailed(String),
    #[error("Phonemizer worker is not running")]
    WorkerUnavailable,
    #[error("Model not loaded. Call load_model() first.")]
    ModelNotLoaded,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("Inference session lock poisoned")]
    SessionPoisoned,
    #[error("Synthesis of sentence {index} failed: {source}")]
    SentenceFailed {
        index: usize,
        #[source]
        source: Box<VitsError>,
    },
}

/// Per-call prosody controls passed straight to the acoustic model.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    /// Speaker for multi-speaker voices. Ignored by single-speaker voices.
    pub speaker_id: Option<i64>,
    /// Duration multiplier (inverse speaking rate).
    pub length_scale: f32,
    /// Pronunciation variation.
    pub noise_scale: f32,
    /// Phoneme duration variation.
    pub noise_w: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            speaker_id: None,
            length_scale: 1.0,
            noise_scale: 0.667,
            noise_w: 0.8,
        }
    }
}

/// Turns one token-ID sequence into one waveform.
pub trait AcousticModel {
    fn synthesize(&self, ids: &[i64], params: &InferenceParams) -> Result<Vec<f32>, VitsError>;

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// A loaded VITS sequence-to-waveform ONNX model.
///
/// The session sits behind a mutex so one synthesizer can be shared between
/// threads; calls are serialized through it.
pub struct AcousticSynthesizer {
    session: Mutex<Session>,
    multi_speaker: bool,
    num_speakers: Option<u32>,
    sample_rate: u32,
}

impl AcousticSynthesizer {
    /// Load a model from an `.onnx` file or a directory containing one.
    ///
    /// The execution provider is fixed for the lifetime of the session: CUDA
    /// (falling back to CPU) when `use_cuda` is set, CPU otherwise. Sample
    /// rate and speaker count come from `voice`.
    pub fn load(
        model_path: &Path,
        use_cuda: bool,
        num_threads: Option<usize>,
        voice: &VoiceConfig,
    ) -> Result<Self, VitsError> {
        let onnx_path = find_onnx_file(model_path)?;
        log::info!("Loading VITS model from {}", onnx_path.display());

        let session = init_session(&onnx_path, use_cuda, num_threads)?;
        let multi_speaker = detect_speaker_input(&session);
        let sample_rate = voice.sample_rate();
        log::info!(
            "Detected: multi_speaker={}, num_speakers={}, sample_rate={}",
            multi_speaker,
            voice
                .num_speakers
                .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            sample_rate
        );

        Ok(Self {
            session: Mutex::new(session),
            multi_speaker,
            num_speakers: voice.num_speakers,
            sample_rate,
        })
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.multi_speaker
    }

    /// Speaker count from the voice config, if it declares one.
    pub fn num_speakers(&self) -> Option<u32> {
        self.num_speakers
    }
}

/// The `sid` to feed the model, if any.
///
/// Multi-speaker models default to speaker 0. Ids outside the declared
/// speaker count are passed through with a warning.
fn resolve_speaker(
    multi_speaker: bool,
    num_speakers: Option<u32>,
    requested: Option<i64>,
) -> Option<i64> {
    if !multi_speaker {
        if let Some(sid) = requested {
            log::warn!("Ignoring speaker id {sid}: model has a single speaker");
        }
        return None;
    }

    let sid = requested.unwrap_or(0);
    if let Some(count) = num_speakers {
        if sid < 0 || sid >= i64::from(count) {
            log::warn!("Speaker id {sid} is outside the voice's {count} speakers");
        }
    }
    Some(sid)
}

impl AcousticModel for AcousticSynthesizer {
    /// Run one forward pass. Inputs follow the Piper VITS export:
    /// `input [1, N]`, `input_lengths [1]`, `scales [3]` and, for
    /// multi-speaker voices, `sid [1]`.
    fn synthesize(&self, ids: &[i64], params: &InferenceParams) -> Result<Vec<f32>, VitsError> {
        if ids.is_empty() {
            return Err(VitsError::Config(
                "refusing to run inference on an empty id sequence".to_string(),
            ));
        }

        let input = Array2::from_shape_vec((1, ids.len()), ids.to_vec())?;
        let input_lengths = ndarray::arr1(&[ids.len() as i64]);
        let scales = ndarray::arr1(&[params.noise_scale, params.length_scale, params.noise_w]);
        let speaker = resolve_speaker(self.multi_speaker, self.num_speakers, params.speaker_id);

        let mut session = self
            .session
            .lock()
            .map_err(|_| VitsError::SessionPoisoned)?;

        let output = match speaker {
            Some(sid) => {
                let sid_arr = ndarray::arr1(&[sid]);
                let inputs = inputs![
                    "input" => TensorRef::from_array_view(input.view())?,
                    "input_lengths" => TensorRef::from_array_view(input_lengths.view())?,
                    "scales" => TensorRef::from_array_view(scales.view())?,
                    "sid" => TensorRef::from_array_view(sid_arr.view())?,
                ];
                session.run(inputs)?
            }
            None => {
                let inputs = inputs![
                    "input" => TensorRef::from_array_view(input.view())?,
                    "input_lengths" => TensorRef::from_array_view(input_lengths.view())?,
                    "scales" => TensorRef::from_array_view(scales.view())?,
                ];
                session.run(inputs)?
            }
        };

        // First output is the waveform, shaped [1, 1, .., T].
        let first_output = output
            .iter()
            .next()
            .ok_or_else(|| VitsError::UnexpectedOutput("model produced no outputs".to_string()))?;
        let waveform = first_output.1.try_extract_array::<f32>()?;

        let shape = waveform.shape().to_vec();
        let time = shape.last().copied().unwrap_or(0);
        if waveform.len() != time {
            return Err(VitsError::UnexpectedOutput(format!(
                "expected a single-batch mono waveform, got shape {shape:?}"
            )));
        }

        let samples: Vec<f32> = waveform.iter().copied().collect();
        log::debug!("Synthesized {} samples from {} ids", samples.len(), ids.len());
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Resolve the ONNX model file.
///
/// A file path is used as-is. For a directory, `glados.onnx` is preferred,
/// then the first `.onnx` file found.
pub fn find_onnx_file(model_path: &Path) -> Result<PathBuf, VitsError> {
    if model_path.is_file() {
        return Ok(model_path.to_path_buf());
    }
    if !model_path.is_dir() {
        return Err(VitsError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Model not found at {}", model_path.display()),
        )));
    }

    let preferred = model_path.join(DEFAULT_MODEL_FILE);
    if preferred.exists() {
        return Ok(preferred);
    }

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(model_path)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("onnx") {
            candidates.push(path);
        }
    }
    candidates.sort();

    match candidates.into_iter().next() {
        Some(path) => {
            log::info!("Using ONNX file: {}", path.display());
            Ok(path)
        }
        None => Err(VitsError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No .onnx file found in {}", model_path.display()),
        ))),
    }
}

fn init_session(
    onnx_path: &Path,
    use_cuda: bool,
    num_threads: Option<usize>,
) -> Result<Session, VitsError> {
    let providers = if use_cuda {
        log::info!("Requesting CUDA execution provider (CPU fallback)");
        vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]
    } else {
        vec![CPUExecutionProvider::default().build()]
    };

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(providers)?;

    if let Some(threads) = num_threads {
        builder = builder
            .with_intra_threads(threads)?
            .with_inter_threads(threads)?;
    }

    Ok(builder.commit_from_file(onnx_path)?)
}

fn detect_speaker_input(session: &Session) -> bool {
    for input in session.inputs() {
        if input.name() == "sid" {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::{
        find_onnx_file, resolve_speaker, AcousticModel, AcousticSynthesizer, InferenceParams,
        VitsError,
    };
    use crate::engines::vits::config::VoiceConfig;
    use crate::engines::vits::encoder::TokenEncoder;
    use std::path::Path;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vits-tts-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn default_scales_match_piper_defaults() {
        let params = InferenceParams::default();
        assert_eq!(params.speaker_id, None);
        assert_eq!(params.length_scale, 1.0);
        assert_eq!(params.noise_scale, 0.667);
        assert_eq!(params.noise_w, 0.8);
    }

    #[test]
    fn speaker_ids_follow_the_model_kind() {
        assert_eq!(resolve_speaker(false, None, None), None);
        assert_eq!(resolve_speaker(false, Some(4), Some(2)), None);
        assert_eq!(resolve_speaker(true, Some(4), None), Some(0));
        assert_eq!(resolve_speaker(true, Some(4), Some(3)), Some(3));
        // Out of range is forwarded; the model decides.
        assert_eq!(resolve_speaker(true, Some(4), Some(7)), Some(7));
        assert_eq!(resolve_speaker(true, None, Some(7)), Some(7));
    }

    #[test]
    fn prefers_default_model_file_in_directory() {
        let dir = scratch_dir("prefer");
        std::fs::write(dir.join("a-voice.onnx"), b"").unwrap();
        std::fs::write(dir.join("glados.onnx"), b"").unwrap();
        assert_eq!(find_onnx_file(&dir).unwrap(), dir.join("glados.onnx"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn falls_back_to_first_onnx_file() {
        let dir = scratch_dir("fallback");
        std::fs::write(dir.join("b.onnx"), b"").unwrap();
        std::fs::write(dir.join("a.onnx"), b"").unwrap();
        std::fs::write(dir.join("a.onnx.json"), b"{}").unwrap();
        assert_eq!(find_onnx_file(&dir).unwrap(), dir.join("a.onnx"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_model_is_a_construction_error() {
        let result = AcousticSynthesizer::load(
            Path::new("/no/such/model.onnx"),
            false,
            None,
            &VoiceConfig::default(),
        );
        assert!(matches!(result, Err(VitsError::Io(_))));
    }

    #[test]
    fn synthesizes_glados_model_when_present() {
        // Skip when the model artifact has not been downloaded.
        let model = Path::new("models/glados.onnx");
        if !model.exists() {
            return;
        }
        let voice = VoiceConfig::default();
        let synth = AcousticSynthesizer::load(model, false, Some(1), &voice).unwrap();
        assert_eq!(synth.sample_rate(), 22050);
        let ids = TokenEncoder::default().encode("həlˈoʊ");
        let samples = synth.synthesize(&ids, &InferenceParams::default()).unwrap();
        assert!(!samples.is_empty());
        assert!(synth.synthesize(&[], &InferenceParams::default()).is_err());
    }
}
