//! チェックポイントの保存・読み込み
//!
//! ディレクトリ構成:
//! - `model.bin`: モデル重み（Burnバイナリ形式）
//! - `optimizer.bin`: オプティマイザ状態
//! - `checkpoint.json`: エポック・メトリクス・モデル設定・テンソル形状
//! - `vocab_src.json` / `vocab_tgt.json`: 語彙
//!
//! 各ファイルは一時ディレクトリに書いてから置き換える。

use crate::error::{Result, TranslatorError};
use crate::transformer::{Transformer, TransformerConfig};
use crate::vocabulary::Vocabulary;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.bin";
pub const OPTIMIZER_FILE: &str = "optimizer.bin";
pub const MANIFEST_FILE: &str = "checkpoint.json";
pub const SOURCE_VOCAB_FILE: &str = "vocab_src.json";
pub const TARGET_VOCAB_FILE: &str = "vocab_tgt.json";

const STAGING_DIR: &str = ".staging";

/// 保存時点のスカラーメトリクス
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckpointMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub train_bleu: f64,
    pub val_bleu: f64,
    pub train_nist: f64,
    pub val_nist: f64,
}

/// 保存されたテンソルの名前と形状
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorShape {
    pub name: String,
    pub shape: Vec<usize>,
}

/// checkpoint.json の内容
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointManifest {
    pub metrics: CheckpointMetrics,
    pub model: TransformerConfig,
    pub parameter_shapes: Vec<TensorShape>,
    pub saved_at: String,
    pub crate_version: String,
}

impl CheckpointManifest {
    pub fn new(metrics: CheckpointMetrics, model: &TransformerConfig) -> Self {
        let parameter_shapes = model
            .parameter_shapes()
            .into_iter()
            .map(|(name, shape)| TensorShape { name, shape })
            .collect();

        Self {
            metrics,
            model: model.clone(),
            parameter_shapes,
            saved_at: chrono::Local::now().to_rfc3339(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// 期待する形状と照合し、最初に一致しないテンソルを返す
    pub fn check_shapes(&self, expected: &TransformerConfig) -> Result<()> {
        for (name, shape) in expected.parameter_shapes() {
            let found = self
                .parameter_shapes
                .iter()
                .find(|saved| saved.name == name)
                .map(|saved| saved.shape.clone())
                .unwrap_or_default();

            if found != shape {
                return Err(TranslatorError::ShapeMismatch {
                    tensor: name,
                    expected: shape,
                    found,
                });
            }
        }

        // 保存側にだけ存在するテンソル
        let expected_count = expected.parameter_shapes().len();
        if self.parameter_shapes.len() != expected_count {
            if let Some(extra) = self.parameter_shapes.iter().find(|saved| {
                !expected
                    .parameter_shapes()
                    .iter()
                    .any(|(name, _)| *name == saved.name)
            }) {
                return Err(TranslatorError::ShapeMismatch {
                    tensor: extra.name.clone(),
                    expected: Vec::new(),
                    found: extra.shape.clone(),
                });
            }
        }

        Ok(())
    }
}

/// チェックポイントに書き込む内容
pub struct CheckpointContents<'a, B: Backend, R: Record<B>> {
    pub model: &'a Transformer<B>,
    pub model_config: &'a TransformerConfig,
    pub optimizer: Option<R>,
    pub metrics: CheckpointMetrics,
    pub src_vocab: &'a Vocabulary,
    pub tgt_vocab: &'a Vocabulary,
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// 一時ディレクトリに書いてから `dir/file_name` へ移動する
fn write_staged(
    dir: &Path,
    file_name: &str,
    write: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let staging = dir.join(STAGING_DIR);
    fs::create_dir_all(&staging)?;

    let staged_path = staging.join(file_name);
    write(&staged_path)?;
    fs::rename(&staged_path, dir.join(file_name))?;
    Ok(())
}

/// チェックポイントを保存
pub fn save_checkpoint<B: Backend, R: Record<B>>(
    dir: &Path,
    contents: CheckpointContents<'_, B, R>,
) -> Result<()> {
    fs::create_dir_all(dir)?;

    write_staged(dir, MODEL_FILE, |path| {
        contents
            .model
            .clone()
            .save_file(path.to_path_buf(), &recorder())
            .map_err(|e| TranslatorError::Recorder(format!("モデル保存エラー: {:?}", e)))
    })?;

    if let Some(record) = contents.optimizer {
        write_staged(dir, OPTIMIZER_FILE, |path| {
            Recorder::<B>::record(&recorder(), record, path.to_path_buf())
                .map(|_| ())
                .map_err(|e| {
                    TranslatorError::Recorder(format!("オプティマイザ保存エラー: {:?}", e))
                })
        })?;
    }

    let manifest = CheckpointManifest::new(contents.metrics, contents.model_config);
    write_staged(dir, MANIFEST_FILE, |path| {
        fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    })?;

    write_staged(dir, SOURCE_VOCAB_FILE, |path| contents.src_vocab.save(path))?;
    write_staged(dir, TARGET_VOCAB_FILE, |path| contents.tgt_vocab.save(path))?;

    fs::remove_dir(dir.join(STAGING_DIR)).ok();

    tracing::info!(
        "チェックポイントを保存: {} (epoch {})",
        dir.display(),
        manifest.metrics.epoch
    );
    Ok(())
}

pub fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let content = fs::read_to_string(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

pub fn load_vocabularies(dir: &Path) -> Result<(Vocabulary, Vocabulary)> {
    Ok((
        Vocabulary::load(dir.join(SOURCE_VOCAB_FILE))?,
        Vocabulary::load(dir.join(TARGET_VOCAB_FILE))?,
    ))
}

/// 指定した構成でモデルを作り、形状を検証してから重みを読み込む
pub fn load_model_with_config<B: Backend>(
    dir: &Path,
    config: &TransformerConfig,
    device: &B::Device,
) -> Result<Transformer<B>> {
    let manifest = read_manifest(dir)?;
    manifest.check_shapes(config)?;

    let model = config.init::<B>(device)?;
    let record = Recorder::<B>::load(&recorder(), model_path(dir), device)
        .map_err(|e| TranslatorError::Recorder(format!("モデル読み込みエラー: {:?}", e)))?;

    Ok(model.load_record(record))
}

/// checkpoint.json に記録された構成でモデルを読み込む
pub fn load_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(Transformer<B>, CheckpointManifest)> {
    let manifest = read_manifest(dir)?;
    let model = load_model_with_config(dir, &manifest.model, device)?;
    Ok((model, manifest))
}

/// オプティマイザ状態を読み込む（保存されていなければ None）
pub fn load_optimizer_record<B: Backend, R: Record<B>>(
    dir: &Path,
    device: &B::Device,
) -> Result<Option<R>> {
    let path = dir.join(OPTIMIZER_FILE);
    if !path.exists() {
        return Ok(None);
    }

    Recorder::<B>::load(&recorder(), path, device)
        .map(Some)
        .map_err(|e| TranslatorError::Recorder(format!("オプティマイザ読み込みエラー: {:?}", e)))
}

fn model_path(dir: &Path) -> PathBuf {
    dir.join(MODEL_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransformerConfig {
        TransformerConfig::new(8, 11, 11, 6)
            .with_num_layers(1)
            .with_n_heads(2)
    }

    #[test]
    fn matching_shapes_pass() {
        let manifest = CheckpointManifest::new(CheckpointMetrics::default(), &config());
        assert!(manifest.check_shapes(&config()).is_ok());
    }

    #[test]
    fn vocab_change_names_embedding() {
        let manifest = CheckpointManifest::new(CheckpointMetrics::default(), &config());
        let changed = TransformerConfig::new(8, 12, 11, 6)
            .with_num_layers(1)
            .with_n_heads(2);

        match manifest.check_shapes(&changed) {
            Err(TranslatorError::ShapeMismatch {
                tensor,
                expected,
                found,
            }) => {
                assert_eq!(tensor, "encoder.embedding.weight");
                assert_eq!(expected, vec![12, 8]);
                assert_eq!(found, vec![11, 8]);
            }
            other => panic!("ShapeMismatch expected, got {:?}", other),
        }
    }

    #[test]
    fn extra_saved_layer_is_reported() {
        let deeper = config().with_num_layers(2);
        let manifest = CheckpointManifest::new(CheckpointMetrics::default(), &deeper);

        let err = manifest.check_shapes(&config()).unwrap_err();
        assert!(err.to_string().contains("encoder.layers.1"));
    }
}
