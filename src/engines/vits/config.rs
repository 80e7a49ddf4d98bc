use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::model::{InferenceParams, VitsError, SAMPLE_RATE};
use super::vocab::PhonemeIdMap;

/// Voice metadata shipped next to a model as `<model>.onnx.json`.
///
/// Every section is optional; missing values fall back to the GLaDOS voice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub espeak: EspeakSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub phoneme_id_map: HashMap<String, Vec<i64>>,
    #[serde(default)]
    pub num_speakers: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioSection {
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EspeakSection {
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InferenceSection {
    pub noise_scale: Option<f32>,
    pub length_scale: Option<f32>,
    pub noise_w: Option<f32>,
}

impl VoiceConfig {
    pub fn load(path: &Path) -> Result<Self, VitsError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, VitsError> {
        serde_json::from_str(content)
            .map_err(|e| VitsError::Config(format!("Failed to parse voice config: {e}")))
    }

    /// Config for `model_path`, if a sibling `<model>.onnx.json` exists.
    pub fn for_model(model_path: &Path) -> Result<Option<Self>, VitsError> {
        let path = config_path_for(model_path);
        if !path.exists() {
            return Ok(None);
        }
        log::info!("Loading voice config from {}", path.display());
        Self::load(&path).map(Some)
    }

    /// The phoneme table from this config, or the hardcoded one if it has none.
    pub fn phoneme_id_map(&self) -> Result<PhonemeIdMap, VitsError> {
        if self.phoneme_id_map.is_empty() {
            log::warn!("Voice config has no phoneme_id_map, using hardcoded table");
            return Ok(PhonemeIdMap::hardcoded());
        }
        PhonemeIdMap::from_config_map(&self.phoneme_id_map)
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate.unwrap_or(SAMPLE_RATE)
    }

    /// Default inference scales, overridden by the config's `inference` section.
    pub fn inference_defaults(&self) -> InferenceParams {
        let base = InferenceParams::default();
        InferenceParams {
            speaker_id: None,
            length_scale: self.inference.length_scale.unwrap_or(base.length_scale),
            noise_scale: self.inference.noise_scale.unwrap_or(base.noise_scale),
            noise_w: self.inference.noise_w.unwrap_or(base.noise_w),
        }
    }
}

fn config_path_for(model_path: &Path) -> PathBuf {
    let mut name = model_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}
