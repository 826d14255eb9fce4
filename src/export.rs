use crate::error::Result;
use crate::transformer::Transformer;
use burn::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// これより長いシーケンスはCSV出力しない
const MAX_EXPORT_SEQ_LEN: usize = 20;

/// Attention行列をCSVファイルにエクスポート
///
/// attn_weights: [batch, n_heads, seq_len_q, seq_len_k] のAttention重み
/// save_dir: 保存先ディレクトリ（`exports/` 以下に書き出す）
/// layer_name: レイヤー名（例: "encoder_layer1"）
pub fn export_attention_to_csv<B: Backend>(
    attn_weights: &Tensor<B, 4>,
    save_dir: &Path,
    layer_name: &str,
) -> Result<Vec<PathBuf>> {
    let exports_dir = save_dir.join("exports");
    fs::create_dir_all(&exports_dir)?;

    let [batch_size, n_heads, seq_len_q, seq_len_k] = attn_weights.dims();

    // シーケンス長が長すぎる場合は警告
    if seq_len_q > MAX_EXPORT_SEQ_LEN || seq_len_k > MAX_EXPORT_SEQ_LEN {
        tracing::warn!(
            "シーケンス長が{}と長いため、CSV出力をスキップします（推奨: {}以下）",
            seq_len_q.max(seq_len_k),
            MAX_EXPORT_SEQ_LEN
        );
        return Ok(Vec::new());
    }

    // データをホストに転送
    let attn_data: Vec<f32> = attn_weights.to_data().iter::<f32>().collect();
    let mut written = Vec::with_capacity(batch_size * n_heads);

    // 各バッチ・各ヘッドごとにCSVファイルを作成
    for batch_idx in 0..batch_size {
        for head_idx in 0..n_heads {
            let filename = format!("{}_batch{}_head{}.csv", layer_name, batch_idx, head_idx);
            let filepath = exports_dir.join(filename);

            let mut csv_content = String::new();

            // ヘッダー行（列番号）
            csv_content.push_str("query\\key");
            for key_idx in 0..seq_len_k {
                csv_content.push_str(&format!(",{}", key_idx));
            }
            csv_content.push('\n');

            // データ行
            for query_idx in 0..seq_len_q {
                csv_content.push_str(&format!("{}", query_idx));
                for key_idx in 0..seq_len_k {
                    let index = batch_idx * (n_heads * seq_len_q * seq_len_k)
                        + head_idx * (seq_len_q * seq_len_k)
                        + query_idx * seq_len_k
                        + key_idx;
                    csv_content.push_str(&format!(",{:.6}", attn_data[index]));
                }
                csv_content.push('\n');
            }

            fs::write(&filepath, csv_content)?;
            tracing::debug!("Attention行列を出力: {}", filepath.display());
            written.push(filepath);
        }
    }

    Ok(written)
}

/// Encoder全層の自己注意をエクスポート（encoder_layer1, encoder_layer2, ...）
pub fn export_encoder_attention<B: Backend>(
    model: &Transformer<B>,
    src_tokens: Tensor<B, 2, Int>,
    save_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for (layer_idx, weights) in model.encoder_attention(src_tokens)?.iter().enumerate() {
        let layer_name = format!("encoder_layer{}", layer_idx + 1);
        written.extend(export_attention_to_csv(weights, save_dir, &layer_name)?);
    }

    tracing::info!(
        "Attention行列を出力: {} ファイル ({})",
        written.len(),
        save_dir.join("exports").display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn writes_one_file_per_head() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let weights = Tensor::<NdArray, 4>::ones([1, 2, 3, 3], &device).div_scalar(3.0);

        let files = export_attention_to_csv(&weights, dir.path(), "encoder_layer1").unwrap();
        assert_eq!(files.len(), 2);

        let content = fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "query\\key,0,1,2");
        assert_eq!(lines[1], "0,0.333333,0.333333,0.333333");
    }

    #[test]
    fn long_sequences_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let weights = Tensor::<NdArray, 4>::zeros([1, 1, 21, 21], &device);

        let files = export_attention_to_csv(&weights, dir.path(), "encoder_layer1").unwrap();
        assert!(files.is_empty());
    }
}
