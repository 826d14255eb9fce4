use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub const PAD_ID: usize = 0; // Padding
pub const UNK_ID: usize = 1; // Unknown
pub const SOS_ID: usize = 2; // Start of Sequence
pub const EOS_ID: usize = 3; // End of Sequence

const SPECIAL_TOKENS: [&str; 4] = ["<PAD>", "<UNK>", "<SOS>", "<EOS>"];

/// 単語単位の語彙（ソース・ターゲット共通）
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vocabulary {
    pub id_to_word: Vec<String>,
    #[serde(skip)]
    word_to_id: HashMap<String, usize>,
}

impl Vocabulary {
    /// データセットから語彙を構築
    pub fn from_sentences<S: AsRef<str>>(sentences: &[S]) -> Self {
        let mut words: Vec<String> = SPECIAL_TOKENS.iter().map(|s| s.to_string()).collect();

        // アルファベット順にソート（再現性のため）
        let word_set: BTreeSet<String> = sentences
            .iter()
            .flat_map(|sentence| Self::tokenize(sentence.as_ref()))
            .filter(|word| !SPECIAL_TOKENS.contains(&word.as_str()))
            .collect();
        words.extend(word_set);

        Self::from_words(words)
    }

    fn from_words(id_to_word: Vec<String>) -> Self {
        let word_to_id = id_to_word
            .iter()
            .enumerate()
            .map(|(id, word)| (word.clone(), id))
            .collect();

        Self {
            id_to_word,
            word_to_id,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_word.len()
    }

    /// 文を単語単位でトークン化（小文字化、句読点処理）
    pub fn tokenize(text: &str) -> Vec<String> {
        let mut normalized = String::with_capacity(text.len() + 8);
        for c in text.to_lowercase().chars() {
            if matches!(c, ',' | '.' | '!' | '?' | ';' | ':' | '"' | '(' | ')') {
                normalized.push(' ');
                normalized.push(c);
                normalized.push(' ');
            } else {
                normalized.push(c);
            }
        }

        normalized
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    /// 文をトークンIDに変換（未知語は<UNK>）
    pub fn encode(&self, text: &str) -> Vec<usize> {
        Self::tokenize(text)
            .iter()
            .map(|word| self.word_to_id.get(word).copied().unwrap_or(UNK_ID))
            .collect()
    }

    /// トークンIDを文に変換（特殊トークンは出力しない、EOSで終了）
    pub fn decode(&self, token_ids: &[usize]) -> String {
        token_ids
            .iter()
            .take_while(|&&id| id != EOS_ID)
            .filter(|&&id| id != PAD_ID && id != SOS_ID)
            .filter_map(|&id| self.id_to_word.get(id).cloned())
            .collect::<Vec<String>>()
            .join(" ")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let loaded: Self = serde_json::from_str(&content)?;
        Ok(Self::from_words(loaded.id_to_word))
    }
}

/// シーケンスを指定長でパディング・切り詰め
pub fn pad_sequence(tokens: &[usize], seq_len: usize) -> Vec<usize> {
    let mut padded = tokens.to_vec();
    padded.resize(seq_len, PAD_ID);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::from_sentences(&["Hello, world!", "the world is big."])
    }

    #[test]
    fn special_tokens_have_fixed_ids() {
        let vocab = vocab();
        assert_eq!(vocab.id_to_word[PAD_ID], "<PAD>");
        assert_eq!(vocab.id_to_word[UNK_ID], "<UNK>");
        assert_eq!(vocab.id_to_word[SOS_ID], "<SOS>");
        assert_eq!(vocab.id_to_word[EOS_ID], "<EOS>");
    }

    #[test]
    fn tokenize_splits_punctuation() {
        assert_eq!(
            Vocabulary::tokenize("Hello, World!"),
            vec!["hello", ",", "world", "!"]
        );
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let vocab = vocab();
        let ids = vocab.encode("hello mars");
        assert_eq!(ids[1], UNK_ID);
        assert_ne!(ids[0], UNK_ID);
    }

    #[test]
    fn decode_stops_at_eos_and_skips_specials() {
        let vocab = vocab();
        let mut ids = vec![SOS_ID];
        ids.extend(vocab.encode("the world"));
        ids.push(EOS_ID);
        ids.extend(vocab.encode("big"));
        assert_eq!(vocab.decode(&ids), "the world");
    }

    #[test]
    fn pad_sequence_pads_and_truncates() {
        assert_eq!(pad_sequence(&[5, 6], 4), vec![5, 6, PAD_ID, PAD_ID]);
        assert_eq!(pad_sequence(&[5, 6, 7], 2), vec![5, 6]);
    }

    #[test]
    fn save_and_load_keep_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = vocab();
        vocab.save(&path).unwrap();

        let loaded = Vocabulary::load(&path).unwrap();
        assert_eq!(loaded, vocab);
        assert_eq!(loaded.encode("world"), vocab.encode("world"));
    }
}
