use crate::config::DataSettings;
use crate::error::{Result, TranslatorError};
use crate::vocabulary::{pad_sequence, Vocabulary, EOS_ID, SOS_ID};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 対訳の1サンプル
///
/// source: [word1, ..., EOS, PAD...]（長さ max_seq_len）
/// target: [SOS, word1, ..., EOS, PAD...]（長さ max_seq_len + 1）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationItem {
    pub index: usize,
    pub source: Vec<usize>,
    pub target: Vec<usize>,
}

/// 対訳テキストの組（ソース文, ターゲット文）
pub struct ParallelCorpus {
    pub pairs: Vec<(String, String)>,
}

impl ParallelCorpus {
    /// TSV（ソース[TAB]ターゲット）または行対応した2ファイルから読み込む
    pub fn load(settings: &DataSettings) -> Result<Self> {
        let mut pairs = match &settings.target_path {
            Some(target_path) => read_aligned(&settings.source_path, target_path)?,
            None => read_tsv(&settings.source_path)?,
        };

        if settings.reverse {
            pairs = pairs.into_iter().map(|(src, tgt)| (tgt, src)).collect();
        }

        if pairs.is_empty() {
            return Err(TranslatorError::Data(format!(
                "対訳ペアがありません: {}",
                settings.source_path.display()
            )));
        }

        tracing::info!("対訳ペア数: {}", pairs.len());
        Ok(Self { pairs })
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// ソース・ターゲットそれぞれの語彙を構築
    pub fn build_vocabularies(&self) -> (Vocabulary, Vocabulary) {
        let sources: Vec<&str> = self.pairs.iter().map(|(src, _)| src.as_str()).collect();
        let targets: Vec<&str> = self.pairs.iter().map(|(_, tgt)| tgt.as_str()).collect();

        (
            Vocabulary::from_sentences(&sources),
            Vocabulary::from_sentences(&targets),
        )
    }
}

fn read_tsv(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path).map_err(|e| {
        TranslatorError::Data(format!("{} が読み込めません: {}", path.display(), e))
    })?;

    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        // 空行とコメント行をスキップ
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 2 {
            tracing::warn!("無効な行形式 (TAB区切りではありません): {}", line);
            continue;
        }

        pairs.push((parts[0].trim().to_string(), parts[1].trim().to_string()));
    }

    Ok(pairs)
}

fn read_aligned(source_path: &Path, target_path: &Path) -> Result<Vec<(String, String)>> {
    let read = |path: &Path| {
        fs::read_to_string(path).map_err(|e| {
            TranslatorError::Data(format!("{} が読み込めません: {}", path.display(), e))
        })
    };
    let sources = read(source_path)?;
    let targets = read(target_path)?;

    let source_lines: Vec<&str> = sources.lines().collect();
    let target_lines: Vec<&str> = targets.lines().collect();
    if source_lines.len() != target_lines.len() {
        return Err(TranslatorError::Data(format!(
            "行数が一致しません: {} 行 / {} 行",
            source_lines.len(),
            target_lines.len()
        )));
    }

    Ok(source_lines
        .into_iter()
        .zip(target_lines)
        .map(|(src, tgt)| (src.trim().to_string(), tgt.trim().to_string()))
        .filter(|(src, tgt)| !src.is_empty() && !tgt.is_empty())
        .collect())
}

/// インデックスでランダムアクセスできる翻訳データセット
pub struct TranslationDataset {
    items: Vec<TranslationItem>,
    max_seq_len: usize,
    src_vocab_size: usize,
    tgt_vocab_size: usize,
}

impl TranslationDataset {
    /// 文をエンコードし、max_seq_len - 1 語を超えるペアは除外する
    pub fn new(
        corpus: &ParallelCorpus,
        src_vocab: &Vocabulary,
        tgt_vocab: &Vocabulary,
        max_seq_len: usize,
    ) -> Self {
        let mut items = Vec::new();
        let mut skipped = 0;

        for (index, (source_text, target_text)) in corpus.pairs.iter().enumerate() {
            let source_tokens = src_vocab.encode(source_text);
            let target_tokens = tgt_vocab.encode(target_text);

            if source_tokens.is_empty()
                || target_tokens.is_empty()
                || source_tokens.len() >= max_seq_len
                || target_tokens.len() >= max_seq_len
            {
                skipped += 1;
                continue;
            }

            let mut source = source_tokens;
            source.push(EOS_ID);

            let mut target = Vec::with_capacity(max_seq_len + 1);
            target.push(SOS_ID);
            target.extend(target_tokens);
            target.push(EOS_ID);

            items.push(TranslationItem {
                index,
                source: pad_sequence(&source, max_seq_len),
                target: pad_sequence(&target, max_seq_len + 1),
            });
        }

        if skipped > 0 {
            tracing::debug!("長さ超過・空文のため {} ペアを除外", skipped);
        }

        Self {
            items,
            max_seq_len,
            src_vocab_size: src_vocab.vocab_size(),
            tgt_vocab_size: tgt_vocab.vocab_size(),
        }
    }

    fn with_items(&self, items: Vec<TranslationItem>) -> Self {
        Self {
            items,
            max_seq_len: self.max_seq_len,
            src_vocab_size: self.src_vocab_size,
            tgt_vocab_size: self.tgt_vocab_size,
        }
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn src_vocab_size(&self) -> usize {
        self.src_vocab_size
    }

    pub fn tgt_vocab_size(&self) -> usize {
        self.tgt_vocab_size
    }

    /// シャッフルして (訓練, 検証) に分割
    pub fn split(mut self, train_fraction: f64, seed: u64) -> (Self, Self) {
        let mut items = std::mem::take(&mut self.items);
        let mut rng = StdRng::seed_from_u64(seed);
        items.shuffle(&mut rng);

        let train_size = ((items.len() as f64) * train_fraction).round() as usize;
        let train_size = train_size.clamp(1.min(items.len()), items.len());
        let val_items = items.split_off(train_size);

        (self.with_items(items), self.with_items(val_items))
    }

    /// バッチごとのインデックス列。seedを渡すとエポックごとに並べ替える
    pub fn batch_indices(&self, batch_size: usize, shuffle_seed: Option<u64>) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.items.len()).collect();
        if let Some(seed) = shuffle_seed {
            indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        indices
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

impl Dataset<TranslationItem> for TranslationDataset {
    fn get(&self, index: usize) -> Option<TranslationItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Teacher Forcing 用にずらしたバッチ
#[derive(Debug, Clone)]
pub struct TranslationBatch<B: Backend> {
    /// [batch_size, max_seq_len]
    pub source: Tensor<B, 2, Int>,
    /// [SOS, word1, ..., wordN]（[batch_size, max_seq_len]）
    pub decoder_input: Tensor<B, 2, Int>,
    /// [word1, ..., wordN, EOS]（[batch_size, max_seq_len]）
    pub decoder_target: Tensor<B, 2, Int>,
}

/// サンプル列をバックエンドのテンソルへ変換する
#[derive(Clone, Debug)]
pub struct TranslationBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> TranslationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn batch(&self, items: &[TranslationItem]) -> TranslationBatch<B> {
        let batch_size = items.len();
        let source_len = items.first().map(|item| item.source.len()).unwrap_or(0);
        let target_len = items.first().map(|item| item.target.len()).unwrap_or(1);

        // 入力テンソル作成
        let flattened_sources: Vec<i64> = items
            .iter()
            .flat_map(|item| item.source.iter().map(|&id| id as i64))
            .collect();
        let source = Tensor::<B, 1, Int>::from_data(flattened_sources.as_slice(), &self.device)
            .reshape([batch_size, source_len]);

        // ターゲットテンソル作成
        let flattened_targets: Vec<i64> = items
            .iter()
            .flat_map(|item| item.target.iter().map(|&id| id as i64))
            .collect();
        let full_target = Tensor::<B, 1, Int>::from_data(flattened_targets.as_slice(), &self.device)
            .reshape([batch_size, target_len]);

        let decoder_input = full_target
            .clone()
            .slice([0..batch_size, 0..target_len - 1]);
        let decoder_target = full_target.slice([0..batch_size, 1..target_len]);

        TranslationBatch {
            source,
            decoder_input,
            decoder_target,
        }
    }

    /// データセットから指定インデックスのサンプルを集めてバッチ化
    pub fn batch_from<D: Dataset<TranslationItem>>(
        &self,
        dataset: &D,
        indices: &[usize],
    ) -> TranslationBatch<B> {
        let items: Vec<TranslationItem> = indices
            .iter()
            .filter_map(|&index| dataset.get(index))
            .collect();
        self.batch(&items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::PAD_ID;
    use burn::backend::NdArray;

    fn corpus() -> ParallelCorpus {
        ParallelCorpus::from_pairs(vec![
            ("hello world".to_string(), "bonjour le monde".to_string()),
            ("good morning".to_string(), "bonjour".to_string()),
            (
                "this sentence is far too long to keep".to_string(),
                "trop long".to_string(),
            ),
            ("thank you".to_string(), "merci".to_string()),
        ])
    }

    #[test]
    fn items_are_padded_and_long_pairs_dropped() {
        let corpus = corpus();
        let (src_vocab, tgt_vocab) = corpus.build_vocabularies();
        let dataset = TranslationDataset::new(&corpus, &src_vocab, &tgt_vocab, 5);

        assert_eq!(dataset.len(), 3);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.source.len(), 5);
        assert_eq!(item.target.len(), 6);
        assert_eq!(item.source[2], EOS_ID);
        assert_eq!(item.source[4], PAD_ID);
        assert_eq!(item.target[0], SOS_ID);
        assert_eq!(item.target[4], EOS_ID);
        assert_eq!(dataset.get(2).unwrap().index, 3);
        assert_eq!(dataset.src_vocab_size(), src_vocab.vocab_size());
        assert_eq!(dataset.tgt_vocab_size(), tgt_vocab.vocab_size());
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let corpus = corpus();
        let (src_vocab, tgt_vocab) = corpus.build_vocabularies();
        let build = || TranslationDataset::new(&corpus, &src_vocab, &tgt_vocab, 5);

        let (train_a, val_a) = build().split(0.67, 50);
        let (train_b, _) = build().split(0.67, 50);
        assert_eq!(train_a.len() + val_a.len(), 3);
        assert_eq!(train_a.get(0), train_b.get(0));

        let val_index = val_a.get(0).unwrap().index;
        assert!((0..train_a.len()).all(|i| train_a.get(i).unwrap().index != val_index));
    }

    #[test]
    fn batch_shifts_target_by_one() {
        let corpus = corpus();
        let (src_vocab, tgt_vocab) = corpus.build_vocabularies();
        let dataset = TranslationDataset::new(&corpus, &src_vocab, &tgt_vocab, 5);
        let batcher = TranslationBatcher::<NdArray>::new(Default::default());

        let batch = batcher.batch_from(&dataset, &[0, 1]);
        assert_eq!(batch.source.dims(), [2, 5]);
        assert_eq!(batch.decoder_input.dims(), [2, 5]);
        assert_eq!(batch.decoder_target.dims(), [2, 5]);

        let input: Vec<i64> = batch.decoder_input.to_data().iter::<i64>().collect();
        let target: Vec<i64> = batch.decoder_target.to_data().iter::<i64>().collect();
        assert_eq!(input[0], SOS_ID as i64);
        assert_eq!(input[1], target[0]);
    }

    #[test]
    fn batch_indices_cover_dataset() {
        let corpus = corpus();
        let (src_vocab, tgt_vocab) = corpus.build_vocabularies();
        let dataset = TranslationDataset::new(&corpus, &src_vocab, &tgt_vocab, 5);

        let batches = dataset.batch_indices(2, Some(7));
        assert_eq!(batches.len(), 2);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, vec![0, 1, 2]);
    }
}
