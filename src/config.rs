//! 実験設定（YAML）
//!
//! `model` / `train` / `logger` / `checkpoint` の各グループは必須キーを持ち、
//! 1つでも欠けていれば計算を始める前に読み込みエラーになる。

use crate::error::{Result, TranslatorError};
use crate::transformer::TransformerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Feed-Forward層の活性化関数
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
}

/// オプティマイザの種類（設定文字列は構築時に一度だけ解決する）
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    #[serde(rename = "adam")]
    Adam,
    #[serde(rename = "adamW")]
    AdamW,
    #[serde(rename = "radam")]
    RAdam,
}

/// 損失関数の種類
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    #[serde(rename = "cross-entropy")]
    CrossEntropy,
    #[serde(rename = "negative-log")]
    NegativeLog,
}

/// モデルハイパーパラメーター
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub hidden_size: usize, // 埋め込み次元
    pub num_layers: usize, // Encoder/Decoderそれぞれのレイヤー数
    pub expansion_factor: usize, // Feed-forward中間層の倍率
    pub n_heads: usize, // Multi-head Attentionのヘッド数
    pub max_seq_length: usize, // 最大シーケンス長
    pub activation: Activation,
    pub norm_first: bool, // trueならPre-LN方式
    pub relative_attention: bool, // 相対位置バイアスを使うか
    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

/// 訓練設定
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainSettings {
    pub batch_size: usize,
    pub epochs: usize,
    pub optimizer: OptimizerKind,
    pub loss_function: LossKind,
    pub label_smoothing: f32,
    pub use_gradient_clipping: bool,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_patience")]
    pub patience: usize, // 改善なしで打ち切るまでのエポック数
    #[serde(default = "default_improvement_margin")]
    pub improvement_margin: f64, // 検証BLEUの改善とみなす最小幅
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// メトリクス記録先の設定
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggerSettings {
    pub logger_name: String,
    pub project_name: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

/// チェックポイント設定
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointSettings {
    /// "none" または再開に使うチェックポイントディレクトリ
    pub checkpoint: String,
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
}

impl CheckpointSettings {
    /// 再開元のディレクトリ（"none"なら新規初期化）
    pub fn resume_from(&self) -> Option<PathBuf> {
        if self.checkpoint.trim().eq_ignore_ascii_case("none") {
            None
        } else {
            Some(PathBuf::from(&self.checkpoint))
        }
    }
}

/// 対訳コーパスの設定
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataSettings {
    /// TSVファイル、またはtarget_pathと行対応するソース側ファイル
    pub source_path: PathBuf,
    #[serde(default)]
    pub target_path: Option<PathBuf>,
    /// trueなら翻訳方向を逆にする
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
}

/// 実験設定ファイル全体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub model: ModelSettings,
    pub train: TrainSettings,
    pub logger: LoggerSettings,
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub data: Option<DataSettings>,
}

fn default_dropout() -> f64 {
    0.2
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_patience() -> usize {
    5
}

fn default_improvement_margin() -> f64 {
    1e-4
}

fn default_seed() -> u64 {
    50
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_train_fraction() -> f64 {
    0.8
}

impl ExperimentConfig {
    /// YAMLファイルから設定を読み込み、検証する
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TranslatorError::Config(format!("{} が読み込めません: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性チェック（テンソルを確保する前に呼ぶ）
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.hidden_size == 0 || model.n_heads == 0 || model.num_layers == 0 {
            return Err(TranslatorError::Config(
                "hidden_size, n_heads, num_layers は1以上が必要です".to_string(),
            ));
        }
        if model.hidden_size % model.n_heads != 0 {
            return Err(TranslatorError::InvalidDimensions {
                embed_dim: model.hidden_size,
                n_heads: model.n_heads,
            });
        }
        if model.hidden_size % 2 != 0 {
            return Err(TranslatorError::Config(format!(
                "hidden_size={} は偶数である必要があります（sin/cosの組）",
                model.hidden_size
            )));
        }
        if model.expansion_factor == 0 || model.max_seq_length < 2 {
            return Err(TranslatorError::Config(
                "expansion_factor は1以上、max_seq_length は2以上が必要です".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(TranslatorError::Config(format!(
                "dropout={} は [0, 1) の範囲外です",
                model.dropout
            )));
        }

        let train = &self.train;
        if train.batch_size == 0 || train.epochs == 0 {
            return Err(TranslatorError::Config(
                "batch_size と epochs は1以上が必要です".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&train.label_smoothing) {
            return Err(TranslatorError::Config(format!(
                "label_smoothing={} は [0, 1] の範囲外です",
                train.label_smoothing
            )));
        }
        if train.learning_rate <= 0.0 {
            return Err(TranslatorError::Config(
                "learning_rate は正の値が必要です".to_string(),
            ));
        }

        if let Some(data) = &self.data {
            if !(data.train_fraction > 0.0 && data.train_fraction < 1.0) {
                return Err(TranslatorError::Config(format!(
                    "train_fraction={} は (0, 1) の範囲外です",
                    data.train_fraction
                )));
            }
        }

        Ok(())
    }

    /// 語彙サイズを与えてモデル設定を作る
    pub fn transformer_config(
        &self,
        src_vocab_size: usize,
        tgt_vocab_size: usize,
    ) -> TransformerConfig {
        let model = &self.model;
        TransformerConfig::new(
            model.hidden_size,
            src_vocab_size,
            tgt_vocab_size,
            model.max_seq_length,
        )
        .with_num_layers(model.num_layers)
        .with_expansion_factor(model.expansion_factor)
        .with_n_heads(model.n_heads)
        .with_dropout(model.dropout)
        .with_activation(model.activation)
        .with_norm_first(model.norm_first)
        .with_relative_attention(model.relative_attention)
    }

    /// データ設定（訓練時は必須）
    pub fn data_settings(&self) -> Result<&DataSettings> {
        self.data
            .as_ref()
            .ok_or_else(|| TranslatorError::Config("data グループがありません".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
model:
  hidden_size: 16
  num_layers: 2
  expansion_factor: 4
  n_heads: 4
  max_seq_length: 10
  activation: relu
  norm_first: false
  relative_attention: false
train:
  batch_size: 8
  epochs: 3
  optimizer: adamW
  loss_function: cross-entropy
  label_smoothing: 0.1
  use_gradient_clipping: true
logger:
  logger_name: test_run
  project_name: test_project
checkpoint:
  checkpoint: none
"#;

    #[test]
    fn parses_required_groups_and_defaults() {
        let config = ExperimentConfig::from_yaml_str(BASE).unwrap();
        assert_eq!(config.model.hidden_size, 16);
        assert_eq!(config.train.optimizer, OptimizerKind::AdamW);
        assert_eq!(config.train.loss_function, LossKind::CrossEntropy);
        assert_eq!(config.train.patience, 5);
        assert_eq!(config.train.seed, 50);
        assert_eq!(config.checkpoint.resume_from(), None);
        assert_eq!(config.logger.log_dir, PathBuf::from("runs"));
        assert!(config.data.is_none());
    }

    #[test]
    fn missing_key_is_fatal() {
        let broken = BASE.replace("  n_heads: 4\n", "");
        let err = ExperimentConfig::from_yaml_str(&broken).unwrap_err();
        assert!(matches!(err, TranslatorError::Yaml(_)));
        assert!(err.to_string().contains("n_heads"));
    }

    #[test]
    fn unknown_optimizer_is_fatal() {
        let broken = BASE.replace("optimizer: adamW", "optimizer: lion");
        assert!(ExperimentConfig::from_yaml_str(&broken).is_err());
    }

    #[test]
    fn indivisible_heads_rejected() {
        let broken = BASE.replace("n_heads: 4", "n_heads: 3");
        let err = ExperimentConfig::from_yaml_str(&broken).unwrap_err();
        assert!(matches!(
            err,
            TranslatorError::InvalidDimensions {
                embed_dim: 16,
                n_heads: 3
            }
        ));
    }

    #[test]
    fn checkpoint_path_is_resumed() {
        let resumed = BASE.replace("checkpoint: none", "checkpoint: checkpoints/latest");
        let config = ExperimentConfig::from_yaml_str(&resumed).unwrap();
        assert_eq!(
            config.checkpoint.resume_from(),
            Some(PathBuf::from("checkpoints/latest"))
        );
    }

    #[test]
    fn transformer_config_carries_model_settings() {
        let config = ExperimentConfig::from_yaml_str(BASE).unwrap();
        let model_config = config.transformer_config(30, 40);
        assert_eq!(model_config.embed_dim, 16);
        assert_eq!(model_config.src_vocab_size, 30);
        assert_eq!(model_config.target_vocab_size, 40);
        assert_eq!(model_config.n_heads, 4);
        assert_eq!(model_config.num_layers, 2);
    }
}
