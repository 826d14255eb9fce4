use thiserror::Error;

/// 翻訳器全体で使うResult型
pub type Result<T> = std::result::Result<T, TranslatorError>;

/// 翻訳器のエラー
#[derive(Debug, Error)]
pub enum TranslatorError {
    /// 設定ファイルの値が不正
    #[error("設定エラー: {0}")]
    Config(String),

    /// 埋め込み次元がヘッド数で割り切れない
    #[error("次元エラー: embed_dim={embed_dim} は n_heads={n_heads} で割り切れません")]
    InvalidDimensions { embed_dim: usize, n_heads: usize },

    /// シーケンス長が位置エンコーディングの範囲を超えている
    #[error("シーケンス長エラー: {0}")]
    Sequence(String),

    /// チェックポイントのテンソル形状が一致しない
    #[error("形状不一致: {tensor} (期待: {expected:?}, 実際: {found:?})")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// コーパスの読み込み・変換エラー
    #[error("データエラー: {0}")]
    Data(String),

    /// Burnレコーダーの保存・読み込みエラー
    #[error("レコーダーエラー: {0}")]
    Recorder(String),

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAMLエラー: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TranslatorError::InvalidDimensions {
            embed_dim: 10,
            n_heads: 3,
        };
        assert_eq!(
            err.to_string(),
            "次元エラー: embed_dim=10 は n_heads=3 で割り切れません"
        );
    }

    #[test]
    fn test_shape_mismatch_names_tensor() {
        let err = TranslatorError::ShapeMismatch {
            tensor: "decoder.embedding.weight".to_string(),
            expected: vec![11, 8],
            found: vec![12, 8],
        };
        assert!(err.to_string().contains("decoder.embedding.weight"));
    }
}
