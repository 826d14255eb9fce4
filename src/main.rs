#![recursion_limit = "256"]

use anyhow::{bail, Context};
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use transformer_translator::checkpoint::load_vocabularies;
use transformer_translator::config::ExperimentConfig;
use transformer_translator::inference::{run_translation_inference, translate};
use transformer_translator::training::train_from_config;

/// Transformer seq2seq 翻訳モデル
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 実験設定ファイル（YAML）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 訓練モード（訓練を実行する場合に指定）
    #[arg(long)]
    train: bool,

    /// モデルを読み込むチェックポイントディレクトリ
    #[arg(long)]
    load: Option<PathBuf>,

    /// 推論するテキスト
    #[arg(long)]
    predict: Option<String>,

    /// バックエンドの選択（auto, wgpu, ndarray）
    #[arg(long, default_value = "wgpu")]
    backend: String,

    /// Attention行列をCSVエクスポート（推論時のみ）
    #[arg(long)]
    export_attn: bool,
}

/// 訓練して、指定があれば訓練直後のモデルで翻訳する
fn train_and_predict<B: AutodiffBackend>(
    config: ExperimentConfig,
    device: B::Device,
    predict: Option<&str>,
) -> anyhow::Result<()> {
    let report = train_from_config::<B>(config, device.clone())?;
    tracing::info!(
        "訓練完了！ {}エポック, 最良検証BLEU {:.4}",
        report.metrics.epochs_run,
        report.metrics.best_val_bleu
    );

    if let Some(text) = predict {
        let (src_vocab, tgt_vocab) = load_vocabularies(&report.checkpoint_dir)?;
        let model = report.model.valid();
        let translation = translate(&model, &src_vocab, &tgt_vocab, text, &device)?;
        println!("入力: {} → 翻訳: {}", text, translation);
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let start_time = Instant::now();
    let args = Args::parse();

    // 訓練モード
    if args.train {
        let Some(config_path) = &args.config else {
            bail!("--train には --config が必要です");
        };
        let config = ExperimentConfig::load(config_path)
            .with_context(|| format!("設定ファイルの読み込みに失敗: {}", config_path.display()))?;

        println!("\n===== 訓練開始 =====");
        let predict = if args.load.is_none() {
            args.predict.as_deref()
        } else {
            None
        };
        match args.backend.as_str() {
            "ndarray" => {
                train_and_predict::<Autodiff<NdArray>>(config, Default::default(), predict)?
            }
            _ => train_and_predict::<Autodiff<Wgpu>>(config, WgpuDevice::default(), predict)?,
        }
    }

    // 推論モード
    if let (Some(predict_text), Some(load_dir)) = (&args.predict, &args.load) {
        println!("\n===== 推論テスト =====");
        let export_dir = args.export_attn.then_some(load_dir.as_path());
        let translation =
            run_translation_inference(&args.backend, load_dir, predict_text, export_dir)?;
        println!("入力: {} → 翻訳: {}", predict_text, translation);
    } else if args.predict.is_some() && !args.train {
        bail!("--predict には --load（または --train）が必要です");
    }

    // デモモード（引数なし）
    if !args.train && args.predict.is_none() {
        println!("===== デモモード =====");
        println!("使用方法:");
        println!("  訓練: cargo run --release -- --train --config configs/transformer.yaml");
        println!(
            "  推論: cargo run --release -- --load checkpoints/transformer_baseline_latest --predict \"hello\""
        );
        println!(
            "  Attention出力: cargo run --release -- --load checkpoints/transformer_baseline_latest --predict \"hello\" --export-attn"
        );
    }

    let duration = start_time.elapsed();
    println!("\n実行時間: {:.2}秒", duration.as_secs_f64());

    Ok(())
}
