use std::collections::HashMap;

use super::model::VitsError;

/// Padding symbol, inserted after every encoded phoneme.
pub const PAD: char = '_';
/// Beginning-of-sequence symbol.
pub const BOS: char = '^';
/// End-of-sequence symbol.
pub const EOS: char = '$';

/// Immutable mapping from a phonetic symbol to the token IDs the acoustic model expects.
///
/// Built once per loaded voice and shared read-only (`Arc<PhonemeIdMap>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhonemeIdMap {
    map: HashMap<char, Vec<i64>>,
}

impl PhonemeIdMap {
    /// Build a table from `(symbol, ids)` pairs.
    ///
    /// Fails if any entry has no IDs or if the PAD, BOS or EOS symbol is missing.
    pub fn from_entries<I>(entries: I) -> Result<Self, VitsError>
    where
        I: IntoIterator<Item = (char, Vec<i64>)>,
    {
        let mut map = HashMap::new();
        for (symbol, ids) in entries {
            if ids.is_empty() {
                return Err(VitsError::Config(format!(
                    "phoneme {symbol:?} maps to an empty id list"
                )));
            }
            map.insert(symbol, ids);
        }

        for required in [PAD, BOS, EOS] {
            if !map.contains_key(&required) {
                return Err(VitsError::Config(format!(
                    "phoneme id map is missing required symbol {required:?}"
                )));
            }
        }

        Ok(Self { map })
    }

    /// Build a table from the string-keyed `phoneme_id_map` of a voice config.
    ///
    /// Keys that are not exactly one character can never match during encoding
    /// and are skipped.
    pub fn from_config_map(raw: &HashMap<String, Vec<i64>>) -> Result<Self, VitsError> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, ids) in raw {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => entries.push((ch, ids.clone())),
                _ => log::warn!("Skipping multi-character phoneme key {key:?}"),
            }
        }
        Self::from_entries(entries)
    }

    /// The canonical table shipped with the GLaDOS voice.
    pub fn hardcoded() -> Self {
        let map = HARDCODED_IDS
            .iter()
            .map(|&(symbol, ids)| (symbol, ids.to_vec()))
            .collect();
        Self { map }
    }

    /// IDs for a single symbol, or `None` if the model has no token for it.
    pub fn get(&self, symbol: char) -> Option<&[i64]> {
        self.map.get(&symbol).map(Vec::as_slice)
    }

    pub fn pad(&self) -> &[i64] {
        self.required(PAD)
    }

    pub fn bos(&self) -> &[i64] {
        self.required(BOS)
    }

    pub fn eos(&self) -> &[i64] {
        self.required(EOS)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn required(&self, symbol: char) -> &[i64] {
        // Both constructors guarantee presence.
        self.get(symbol).unwrap_or(&[])
    }
}

impl Default for PhonemeIdMap {
    fn default() -> Self {
        Self::hardcoded()
    }
}

/// Phoneme ID table of the GLaDOS voice (from its `.onnx.json`).
const HARDCODED_IDS: &[(char, &[i64])] = &[
    ('_', &[0]),
    ('^', &[1]),
    ('$', &[2]),
    (' ', &[3]),
    ('!', &[4]),
    ('\'', &[5]),
    ('(', &[6]),
    (')', &[7]),
    (',', &[8]),
    ('-', &[9]),
    ('.', &[10]),
    (':', &[11]),
    (';', &[12]),
    ('?', &[13]),
    ('a', &[14]),
    ('b', &[15]),
    ('c', &[16]),
    ('d', &[17]),
    ('e', &[18]),
    ('f', &[19]),
    ('h', &[20]),
    ('i', &[21]),
    ('j', &[22]),
    ('k', &[23]),
    ('l', &[24]),
    ('m', &[25]),
    ('n', &[26]),
    ('o', &[27]),
    ('p', &[28]),
    ('q', &[29]),
    ('r', &[30]),
    ('s', &[31]),
    ('t', &[32]),
    ('u', &[33]),
    ('v', &[34]),
    ('w', &[35]),
    ('x', &[36]),
    ('y', &[37]),
    ('z', &[38]),
    ('æ', &[39]),
    ('ç', &[40]),
    ('ð', &[41]),
    ('ø', &[42]),
    ('ħ', &[43]),
    ('ŋ', &[44]),
    ('œ', &[45]),
    ('ǀ', &[46]),
    ('ǁ', &[47]),
    ('ǂ', &[48]),
    ('ǃ', &[49]),
    ('ɐ', &[50]),
    ('ɑ', &[51]),
    ('ɒ', &[52]),
    ('ɓ', &[53]),
    ('ɔ', &[54]),
    ('ɕ', &[55]),
    ('ɖ', &[56]),
    ('ɗ', &[57]),
    ('ɘ', &[58]),
    ('ə', &[59]),
    ('ɚ', &[60]),
    ('ɛ', &[61]),
    ('ɜ', &[62]),
    ('ɞ', &[63]),
    ('ɟ', &[64]),
    ('ɠ', &[65]),
    ('ɡ', &[66]),
    ('ɢ', &[67]),
    ('ɣ', &[68]),
    ('ɤ', &[69]),
    ('ɥ', &[70]),
    ('ɦ', &[71]),
    ('ɧ', &[72]),
    ('ɨ', &[73]),
    ('ɪ', &[74]),
    ('ɫ', &[75]),
    ('ɬ', &[76]),
    ('ɭ', &[77]),
    ('ɮ', &[78]),
    ('ɯ', &[79]),
    ('ɰ', &[80]),
    ('ɱ', &[81]),
    ('ɲ', &[82]),
    ('ɳ', &[83]),
    ('ɴ', &[84]),
    ('ɵ', &[85]),
    ('ɶ', &[86]),
    ('ɸ', &[87]),
    ('ɹ', &[88]),
    ('ɺ', &[89]),
    ('ɻ', &[90]),
    ('ɽ', &[91]),
    ('ɾ', &[92]),
    ('ʀ', &[93]),
    ('ʁ', &[94]),
    ('ʂ', &[95]),
    ('ʃ', &[96]),
    ('ʄ', &[97]),
    ('ʈ', &[98]),
    ('ʉ', &[99]),
    ('ʊ', &[100]),
    ('ʋ', &[101]),
    ('ʌ', &[102]),
    ('ʍ', &[103]),
    ('ʎ', &[104]),
    ('ʏ', &[105]),
    ('ʐ', &[106]),
    ('ʑ', &[107]),
    ('ʒ', &[108]),
    ('ʔ', &[109]),
    ('ʕ', &[110]),
    ('ʘ', &[111]),
    ('ʙ', &[112]),
    ('ʛ', &[113]),
    ('ʜ', &[114]),
    ('ʝ', &[115]),
    ('ʟ', &[116]),
    ('ʡ', &[117]),
    ('ʢ', &[118]),
    ('ʲ', &[119]),
    ('ˈ', &[120]),
    ('ˌ', &[121]),
    ('ː', &[122]),
    ('ˑ', &[123]),
    ('˞', &[124]),
    ('β', &[125]),
    ('θ', &[126]),
    ('χ', &[127]),
    ('ᵻ', &[128]),
    ('ⱱ', &[129]),
    ('0', &[130]),
    ('1', &[131]),
    ('2', &[132]),
    ('3', &[133]),
    ('4', &[134]),
    ('5', &[135]),
    ('6', &[136]),
    ('7', &[137]),
    ('8', &[138]),
    ('9', &[139]),
    ('\u{0327}', &[140]),
    ('\u{0303}', &[141]),
    ('\u{032A}', &[142]),
    ('\u{032F}', &[143]),
    ('\u{0329}', &[144]),
    ('ʰ', &[145]),
    ('ˤ', &[146]),
    ('ε', &[147]),
    ('↓', &[148]),
    ('#', &[149]),
    ('"', &[150]),
    ('↑', &[151]),
    ('\u{033A}', &[152]),
    ('\u{033B}', &[153]),
    ('g', &[154]),
    ('ʦ', &[155]),
    ('X', &[156]),
];

#[cfg(test)]
mod tests {
    use super::{PhonemeIdMap, BOS, EOS, PAD};
    use std::collections::{HashMap, HashSet};

    #[test]
    fn hardcoded_table_has_sentinels_and_unique_ids() {
        let vocab = PhonemeIdMap::hardcoded();
        assert_eq!(vocab.len(), 157);
        assert_eq!(vocab.pad(), &[0]);
        assert_eq!(vocab.bos(), &[1]);
        assert_eq!(vocab.eos(), &[2]);

        let mut seen = HashSet::new();
        for &(_, ids) in super::HARDCODED_IDS {
            assert!(!ids.is_empty());
            for id in ids {
                assert!(seen.insert(*id), "duplicate id {id}");
            }
        }
    }

    #[test]
    fn lookup_is_stable_across_calls() {
        let vocab = PhonemeIdMap::hardcoded();
        let first = vocab.get('ə').map(<[i64]>::to_vec);
        let second = vocab.get('ə').map(<[i64]>::to_vec);
        assert_eq!(first, Some(vec![59]));
        assert_eq!(first, second);
    }

    #[test]
    fn combining_marks_are_addressable() {
        let vocab = PhonemeIdMap::hardcoded();
        assert_eq!(vocab.get('\u{0303}'), Some(&[141][..]));
        assert_eq!(vocab.get('ʦ'), Some(&[155][..]));
        assert_eq!(vocab.get('A'), None);
    }

    #[test]
    fn rejects_table_without_sentinels() {
        let err = PhonemeIdMap::from_entries(vec![(PAD, vec![0]), (BOS, vec![1])]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_empty_id_lists() {
        let err = PhonemeIdMap::from_entries(vec![
            (PAD, vec![0]),
            (BOS, vec![1]),
            (EOS, vec![2]),
            ('a', vec![]),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn config_map_skips_multi_character_keys() {
        let raw: HashMap<String, Vec<i64>> = [
            ("_", vec![0]),
            ("^", vec![1]),
            ("$", vec![2]),
            ("a", vec![14, 15]),
            ("ts", vec![99]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let vocab = PhonemeIdMap::from_config_map(&raw).unwrap();
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.get('a'), Some(&[14, 15][..]));
    }
}
