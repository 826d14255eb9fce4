//! BLEU / NIST（トークンID列上で計算）
//!
//! 仮説・参照ともに EOS で打ち切り、PAD と SOS は数えない。

use crate::vocabulary::{EOS_ID, PAD_ID, SOS_ID};
use burn::prelude::*;
use std::collections::HashMap;

/// BLEUのn-gram上限
pub const BLEU_MAX_ORDER: usize = 4;
/// NISTのn-gram上限
pub const NIST_MAX_ORDER: usize = 5;

/// 一致数0のn-gram精度に使う値（0除算・log(0)回避）
const SMOOTHING_EPSILON: f64 = 0.1;

/// 評価対象のトークンだけを残す
pub fn clean_tokens(ids: &[usize]) -> Vec<usize> {
    ids.iter()
        .copied()
        .take_while(|&id| id != EOS_ID)
        .filter(|&id| id != PAD_ID && id != SOS_ID)
        .collect()
}

fn ngram_counts(tokens: &[usize], n: usize) -> HashMap<&[usize], usize> {
    let mut counts = HashMap::new();
    if n == 0 || tokens.len() < n {
        return counts;
    }
    for window in tokens.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
    }
    counts
}

/// コーパスBLEU（0.0〜1.0）
pub fn corpus_bleu(hypotheses: &[Vec<usize>], references: &[Vec<usize>]) -> f64 {
    let mut matches = [0usize; BLEU_MAX_ORDER];
    let mut totals = [0usize; BLEU_MAX_ORDER];
    let mut hyp_len = 0;
    let mut ref_len = 0;

    for (hypothesis, reference) in hypotheses.iter().zip(references) {
        hyp_len += hypothesis.len();
        ref_len += reference.len();

        for n in 1..=BLEU_MAX_ORDER {
            let hyp_counts = ngram_counts(hypothesis, n);
            let ref_counts = ngram_counts(reference, n);

            // 参照側の出現回数でクリップ
            matches[n - 1] += hyp_counts
                .iter()
                .map(|(gram, &count)| count.min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum::<usize>();
            totals[n - 1] += hyp_counts.values().sum::<usize>();
        }
    }

    if hyp_len == 0 || matches[0] == 0 {
        return 0.0;
    }

    let log_precision: f64 = (0..BLEU_MAX_ORDER)
        .map(|i| {
            let precision = if matches[i] == 0 {
                SMOOTHING_EPSILON / totals[i].max(1) as f64
            } else {
                matches[i] as f64 / totals[i] as f64
            };
            precision.ln()
        })
        .sum::<f64>()
        / BLEU_MAX_ORDER as f64;

    // 簡潔性ペナルティ
    let brevity_penalty = if hyp_len > ref_len {
        1.0
    } else {
        (1.0 - ref_len as f64 / hyp_len as f64).exp()
    };

    brevity_penalty * log_precision.exp()
}

/// コーパスNIST（n-gramの情報量で重み付け）
pub fn corpus_nist(hypotheses: &[Vec<usize>], references: &[Vec<usize>]) -> f64 {
    // 参照全体のn-gram頻度から情報量を求める
    let mut reference_counts: Vec<HashMap<&[usize], usize>> =
        vec![HashMap::new(); NIST_MAX_ORDER + 1];
    let mut total_reference_words = 0;
    for reference in references {
        total_reference_words += reference.len();
        for n in 1..=NIST_MAX_ORDER {
            for (gram, count) in ngram_counts(reference, n) {
                *reference_counts[n].entry(gram).or_insert(0) += count;
            }
        }
    }

    let information = |gram: &[usize]| -> f64 {
        let n = gram.len();
        let count = reference_counts[n].get(gram).copied().unwrap_or(0);
        if count == 0 {
            return 0.0;
        }
        let prefix_count = if n == 1 {
            total_reference_words
        } else {
            reference_counts[n - 1]
                .get(&gram[..n - 1])
                .copied()
                .unwrap_or(0)
        };
        (prefix_count as f64 / count as f64).log2()
    };

    let mut info_sums = [0.0_f64; NIST_MAX_ORDER];
    let mut totals = [0usize; NIST_MAX_ORDER];
    let mut hyp_len = 0;

    for (hypothesis, reference) in hypotheses.iter().zip(references) {
        hyp_len += hypothesis.len();
        for n in 1..=NIST_MAX_ORDER {
            let hyp_counts = ngram_counts(hypothesis, n);
            let ref_counts = ngram_counts(reference, n);

            for (gram, &count) in &hyp_counts {
                let matched = count.min(ref_counts.get(gram).copied().unwrap_or(0));
                if matched > 0 {
                    info_sums[n - 1] += matched as f64 * information(*gram);
                }
            }
            totals[n - 1] += hyp_counts.values().sum::<usize>();
        }
    }

    if hyp_len == 0 || total_reference_words == 0 {
        return 0.0;
    }

    let score: f64 = (0..NIST_MAX_ORDER)
        .filter(|&i| totals[i] > 0)
        .map(|i| info_sums[i] / totals[i] as f64)
        .sum();

    // 長さ比2/3でペナルティ0.5となるβ
    let beta = 0.5_f64.ln() / 1.5_f64.ln().powi(2);
    let ratio = hyp_len as f64 / (total_reference_words as f64 / references.len() as f64)
        / hypotheses.len().max(1) as f64;
    let length_penalty = if ratio >= 1.0 {
        1.0
    } else {
        (beta * ratio.ln().powi(2)).exp()
    };

    score * length_penalty
}

/// 2次元Intテンソルを行ごとのトークン列に変換
pub fn token_rows<B: Backend>(tokens: Tensor<B, 2, Int>) -> Vec<Vec<usize>> {
    let [_, seq_len] = tokens.dims();
    let values: Vec<usize> = tokens
        .into_data()
        .iter::<i64>()
        .map(|id| id.max(0) as usize)
        .collect();

    if seq_len == 0 {
        return Vec::new();
    }
    values.chunks(seq_len).map(|row| row.to_vec()).collect()
}

/// 出力分布 [batch, seq_len, vocab] の argmax と正解 [batch, seq_len] から (BLEU, NIST)
pub fn batch_scores<B: Backend>(
    probabilities: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
) -> (f64, f64) {
    let [batch_size, seq_len, _] = probabilities.dims();
    let predictions = probabilities.argmax(2).reshape([batch_size, seq_len]);

    let hypotheses: Vec<Vec<usize>> = token_rows(predictions)
        .iter()
        .map(|row| clean_tokens(row))
        .collect();
    let references: Vec<Vec<usize>> = token_rows(targets)
        .iter()
        .map(|row| clean_tokens(row))
        .collect();

    (
        corpus_bleu(&hypotheses, &references),
        corpus_nist(&hypotheses, &references),
    )
}
