use std::sync::Arc;

use super::vocab::PhonemeIdMap;

/// Maps a phonetic transcription to the token IDs fed to the acoustic model.
///
/// Output layout: `BOS + (ids(p) + PAD)* + EOS`. Symbols missing from the
/// table are dropped silently.
#[derive(Debug, Clone)]
pub struct TokenEncoder {
    vocab: Arc<PhonemeIdMap>,
}

impl TokenEncoder {
    pub fn new(vocab: Arc<PhonemeIdMap>) -> Self {
        Self { vocab }
    }

    pub fn vocab(&self) -> &PhonemeIdMap {
        &self.vocab
    }

    pub fn encode(&self, transcription: &str) -> Vec<i64> {
        let pad = self.vocab.pad();
        let mut ids = Vec::with_capacity(transcription.len() * 2 + 2);
        ids.extend_from_slice(self.vocab.bos());

        for symbol in transcription.chars() {
            let Some(symbol_ids) = self.vocab.get(symbol) else {
                continue;
            };
            ids.extend_from_slice(symbol_ids);
            ids.extend_from_slice(pad);
        }

        ids.extend_from_slice(self.vocab.eos());
        ids
    }
}

impl Default for TokenEncoder {
    fn default() -> Self {
        Self::new(Arc::new(PhonemeIdMap::hardcoded()))
    }
}
