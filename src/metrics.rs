use crate::checkpoint::CheckpointMetrics;
use crate::error::Result;
use crate::transformer::TransformerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 訓練メトリクス
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainingMetrics {
    /// エポックごとの損失・BLEU・NIST
    pub history: Vec<CheckpointMetrics>,
    /// 最良の検証BLEU
    pub best_val_bleu: f64,
    /// 実行したエポック数
    pub epochs_run: usize,
    /// patienceによる打ち切りがあったか
    pub stopped_early: bool,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub optimizer: String,
    pub loss_function: String,
}

impl TrainingMetrics {
    pub fn final_loss(&self) -> f64 {
        self.history.last().map(|m| m.train_loss).unwrap_or(0.0)
    }
}

/// メタデータ
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
    pub crate_version: String,
    pub trained_at: String,
}

/// 統合メトリクスファイル
#[derive(Serialize, Deserialize, Debug)]
pub struct MetricsFile {
    pub model_config: TransformerConfig,
    pub training: TrainingMetrics,
    pub metadata: Metadata,
}

/// 実行結果（metrics.json / config.json / README.md）を保存
pub fn save_metrics(
    save_dir: &Path,
    training_metrics: &TrainingMetrics,
    model_config: &TransformerConfig,
    checkpoint_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let metadata = Metadata {
        crate_version: env!("CARGO_PKG_VERSION").to_string(),
        trained_at: chrono::Local::now().to_rfc3339(),
    };

    // metrics.jsonを保存
    let metrics_file = MetricsFile {
        model_config: model_config.clone(),
        training: training_metrics.clone(),
        metadata: metadata.clone(),
    };

    let metrics_json = serde_json::to_string_pretty(&metrics_file)?;
    fs::write(save_dir.join("metrics.json"), metrics_json)?;
    tracing::info!(
        "メトリクスを保存: {}",
        save_dir.join("metrics.json").display()
    );

    // config.jsonを保存
    save_config(save_dir, model_config, training_metrics, &metadata)?;

    // README.mdを自動生成
    save_readme(
        save_dir,
        model_config,
        training_metrics,
        &metadata,
        checkpoint_dir,
    )?;

    Ok(())
}

/// config.jsonを保存
fn save_config(
    save_dir: &Path,
    model_config: &TransformerConfig,
    training_metrics: &TrainingMetrics,
    metadata: &Metadata,
) -> Result<()> {
    #[derive(Serialize)]
    struct ConfigFile<'a> {
        model: &'a TransformerConfig,
        training: TrainingConfig<'a>,
        metadata: &'a Metadata,
    }

    #[derive(Serialize)]
    struct TrainingConfig<'a> {
        learning_rate: f64,
        epochs_run: usize,
        batch_size: usize,
        optimizer: &'a str,
        loss_function: &'a str,
    }

    let config_file = ConfigFile {
        model: model_config,
        training: TrainingConfig {
            learning_rate: training_metrics.learning_rate,
            epochs_run: training_metrics.epochs_run,
            batch_size: training_metrics.batch_size,
            optimizer: &training_metrics.optimizer,
            loss_function: &training_metrics.loss_function,
        },
        metadata,
    };

    let config_json = serde_json::to_string_pretty(&config_file)?;
    fs::write(save_dir.join("config.json"), config_json)?;
    tracing::info!("設定を保存: {}", save_dir.join("config.json").display());

    Ok(())
}

/// README.mdを自動生成
fn save_readme(
    save_dir: &Path,
    model_config: &TransformerConfig,
    training_metrics: &TrainingMetrics,
    metadata: &Metadata,
    checkpoint_dir: &Path,
) -> Result<()> {
    let history_rows: String = training_metrics
        .history
        .iter()
        .map(|m| {
            format!(
                "| {} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} |\n",
                m.epoch, m.train_loss, m.val_loss, m.train_bleu, m.val_bleu, m.train_nist, m.val_nist
            )
        })
        .collect();

    let readme_content = format!(
        r#"# Transformer 翻訳モデル訓練結果

## モデル設定

- **埋め込み次元**: {}
- **ヘッド数**: {}
- **レイヤ数（Encoder/Decoder）**: {}
- **FFN倍率**: {}
- **活性化関数**: {:?}
- **Pre-LN**: {}
- **相対位置バイアス**: {}
- **ソース語彙サイズ**: {}
- **ターゲット語彙サイズ**: {}
- **最大シーケンス長**: {}

## 訓練設定

- **実行エポック数**: {}
- **学習率**: {}
- **バッチサイズ**: {}
- **オプティマイザ**: {}
- **損失関数**: {}
- **最終Loss**: {:.6}
- **最良検証BLEU**: {:.6}
- **早期終了**: {}

## エポック履歴

| epoch | train_loss | val_loss | train_bleu | val_bleu | train_nist | val_nist |
|---|---|---|---|---|---|---|
{}
## 訓練情報

- **訓練日時**: {}
- **クレートバージョン**: {}

## 使用方法

### 推論（WGPU）

```bash
cargo run --release -- \
  --load {} \
  --backend wgpu \
  --predict "hello world"
```

### 推論（NdArray / CPU）

```bash
cargo run --release -- \
  --load {} \
  --backend ndarray \
  --predict "hello world"
```

## ファイル構成

- `config.json`: モデル設定とハイパーパラメータ
- `metrics.json`: エポックごとの損失・BLEU・NIST
- `README.md`: このファイル
"#,
        model_config.embed_dim,
        model_config.n_heads,
        model_config.num_layers,
        model_config.expansion_factor,
        model_config.activation,
        model_config.norm_first,
        model_config.relative_attention,
        model_config.src_vocab_size,
        model_config.target_vocab_size,
        model_config.seq_length,
        training_metrics.epochs_run,
        training_metrics.learning_rate,
        training_metrics.batch_size,
        training_metrics.optimizer,
        training_metrics.loss_function,
        training_metrics.final_loss(),
        training_metrics.best_val_bleu,
        training_metrics.stopped_early,
        history_rows,
        metadata.trained_at,
        metadata.crate_version,
        checkpoint_dir.display(),
        checkpoint_dir.display(),
    );

    fs::write(save_dir.join("README.md"), readme_content)?;
    tracing::info!("READMEを生成: {}", save_dir.join("README.md").display());

    Ok(())
}
