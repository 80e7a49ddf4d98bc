use std::num::NonZeroUsize;
use std::thread;

use derive_builder::Builder;

use crate::SynthesisResult;

use super::encoder::TokenEncoder;
use super::model::{AcousticModel, InferenceParams, VitsError};
use super::phonemizer::Phonemize;

/// What to do when one sentence fails to synthesize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SentenceFailurePolicy {
    /// Fail the whole utterance.
    #[default]
    Abort,
    /// Leave the sentence out, record a warning and keep going.
    Skip,
}

/// Pipeline behaviour. Build with [`PipelineConfigBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[builder(default)]
pub struct PipelineConfig {
    /// Scales used by [`SpeechPipeline::generate`].
    pub inference: InferenceParams,
    pub on_sentence_error: SentenceFailurePolicy,
    /// Synthesize sentences on scoped threads. Output order is unaffected.
    /// [`AcousticSynthesizer`](super::model::AcousticSynthesizer) serializes
    /// forward passes on its session lock, so only models that can run
    /// concurrently gain from this.
    pub parallel: bool,
    /// Most sentences in flight at once when `parallel` is set. `None` uses
    /// the available parallelism.
    pub max_threads: Option<usize>,
}

/// Audio for one input text plus what happened on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub audio: SynthesisResult,
    /// Samples contributed by each extracted sentence, in order (0 if skipped).
    pub sentence_samples: Vec<usize>,
    /// Extraction and skipped-sentence warnings.
    pub warnings: Vec<String>,
}

impl Utterance {
    /// No audio was produced (empty input, or nothing could be phonemized).
    pub fn is_silent(&self) -> bool {
        self.audio.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Text → sentences → token IDs → waveforms → one concatenated waveform.
pub struct SpeechPipeline<P, M> {
    phonemizer: P,
    encoder: TokenEncoder,
    model: M,
    config: PipelineConfig,
}

impl<P, M> SpeechPipeline<P, M>
where
    P: Phonemize,
    M: AcousticModel + Sync,
{
    pub fn new(phonemizer: P, encoder: TokenEncoder, model: M, config: PipelineConfig) -> Self {
        Self {
            phonemizer,
            encoder,
            model,
            config,
        }
    }

    pub fn generate(&self, text: &str) -> Result<Utterance, VitsError> {
        self.generate_with(text, &self.config.inference)
    }

    /// Synthesize `text` with explicit inference scales.
    ///
    /// Sentences are joined back to back with no crossfade or inserted silence.
    /// When no sentence is extracted no inference runs and the result is silent.
    pub fn generate_with(
        &self,
        text: &str,
        params: &InferenceParams,
    ) -> Result<Utterance, VitsError> {
        let sample_rate = self.model.sample_rate();
        let extraction = self.phonemizer.extract(text);
        let mut warnings = extraction.warnings;

        if extraction.sentences.is_empty() {
            if warnings.is_empty() {
                log::debug!("Nothing to synthesize for {text:?}");
            } else {
                log::warn!("No sentences extracted for {text:?}: {warnings:?}");
            }
            return Ok(Utterance {
                audio: SynthesisResult::silent(sample_rate),
                sentence_samples: Vec::new(),
                warnings,
            });
        }

        let encoded: Vec<Vec<i64>> = extraction
            .sentences
            .iter()
            .map(|sentence| self.encoder.encode(sentence))
            .collect();
        log::debug!("Encoded {} sentences", encoded.len());

        let results = if self.config.parallel && encoded.len() > 1 {
            self.synthesize_parallel(&encoded, params)
        } else {
            self.synthesize_sequential(&encoded, params)
        };

        let mut samples = Vec::new();
        let mut sentence_samples = Vec::with_capacity(encoded.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(wave) => {
                    sentence_samples.push(wave.len());
                    samples.extend_from_slice(&wave);
                }
                Err(e) => match self.config.on_sentence_error {
                    SentenceFailurePolicy::Abort => {
                        log::error!("Sentence {index} failed, aborting utterance: {e}");
                        return Err(VitsError::SentenceFailed {
                            index,
                            source: Box::new(e),
                        });
                    }
                    SentenceFailurePolicy::Skip => {
                        log::warn!("Sentence {index} failed, skipping: {e}");
                        warnings.push(format!("sentence {index} skipped: {e}"));
                        sentence_samples.push(0);
                    }
                },
            }
        }

        Ok(Utterance {
            audio: SynthesisResult {
                samples,
                sample_rate,
            },
            sentence_samples,
            warnings,
        })
    }

    fn synthesize_sequential(
        &self,
        encoded: &[Vec<i64>],
        params: &InferenceParams,
    ) -> Vec<Result<Vec<f32>, VitsError>> {
        let mut results = Vec::with_capacity(encoded.len());
        for ids in encoded {
            let result = self.model.synthesize(ids, params);
            let failed = result.is_err();
            results.push(result);
            if failed && self.config.on_sentence_error == SentenceFailurePolicy::Abort {
                break;
            }
        }
        results
    }

    fn synthesize_parallel(
        &self,
        encoded: &[Vec<i64>],
        params: &InferenceParams,
    ) -> Vec<Result<Vec<f32>, VitsError>> {
        let limit = self
            .config
            .max_threads
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
            .max(1);
        let model = &self.model;
        let mut results = Vec::with_capacity(encoded.len());

        for batch in encoded.chunks(limit) {
            thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|ids| scope.spawn(move || model.synthesize(ids, params)))
                    .collect();
                // Joined in spawn order, so results stay in sentence order.
                for handle in handles {
                    results.push(handle.join().unwrap_or_else(|_| {
                        Err(VitsError::UnexpectedOutput(
                            "synthesis thread panicked".to_string(),
                        ))
                    }));
                }
            });
        }
        results
    }

    pub fn phonemizer(&self) -> &P {
        &self.phonemizer
    }

    pub fn encoder(&self) -> &TokenEncoder {
        &self.encoder
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
