use crate::checkpoint::{load_model, load_vocabularies};
use crate::error::{Result, TranslatorError};
use crate::export::export_encoder_attention;
use crate::transformer::Transformer;
use crate::vocabulary::{pad_sequence, Vocabulary, EOS_ID, SOS_ID};
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::prelude::*;
use std::path::Path;

/// 推論に使うモデルと語彙
pub struct Translator<B: Backend> {
    pub model: Transformer<B>,
    pub src_vocab: Vocabulary,
    pub tgt_vocab: Vocabulary,
}

impl<B: Backend> Translator<B> {
    /// チェックポイントディレクトリから読み込み
    pub fn load(load_dir: &Path, device: &B::Device) -> Result<Self> {
        let (model, manifest) = load_model::<B>(load_dir, device)?;
        let (src_vocab, tgt_vocab) = load_vocabularies(load_dir)?;
        tracing::info!(
            "モデルを読み込み: {} (epoch {}, val_bleu {:.4})",
            load_dir.display(),
            manifest.metrics.epoch,
            manifest.metrics.val_bleu
        );

        Ok(Self {
            model,
            src_vocab,
            tgt_vocab,
        })
    }

    /// 入力文を [1, max_seq_len] のトークンテンソルに変換
    pub fn encode_source(&self, input_text: &str, device: &B::Device) -> Tensor<B, 2, Int> {
        encode_source(&self.model, &self.src_vocab, input_text, device)
    }

    pub fn translate(&self, input_text: &str, device: &B::Device) -> Result<String> {
        translate(
            &self.model,
            &self.src_vocab,
            &self.tgt_vocab,
            input_text,
            device,
        )
    }
}

fn encode_source<B: Backend>(
    model: &Transformer<B>,
    src_vocab: &Vocabulary,
    input_text: &str,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let seq_len = model.max_seq_len();

    // トークン化、EOS付与、パディング
    let mut tokens = src_vocab.encode(input_text);
    tokens.truncate(seq_len.saturating_sub(1));
    tokens.push(EOS_ID);
    let tokens: Vec<i64> = pad_sequence(&tokens, seq_len)
        .into_iter()
        .map(|id| id as i64)
        .collect();

    Tensor::<B, 1, Int>::from_data(tokens.as_slice(), device).reshape([1, seq_len])
}

/// 翻訳（ジェネリックBackend）
pub fn translate<B: Backend>(
    model: &Transformer<B>,
    src_vocab: &Vocabulary,
    tgt_vocab: &Vocabulary,
    input_text: &str,
    device: &B::Device,
) -> Result<String> {
    let src_tokens = encode_source(model, src_vocab, input_text, device);
    let prefix = Tensor::<B, 1, Int>::from_data([SOS_ID as i64], device).reshape([1, 1]);

    // 貪欲法でソース長ぶん生成
    let generated = model.decode(src_tokens, prefix)?;
    let generated_ids: Vec<usize> = generated
        .into_data()
        .iter::<i64>()
        .map(|id| id.max(0) as usize)
        .collect();

    // EOSまでを文にデコード
    Ok(tgt_vocab.decode(&generated_ids))
}

fn translate_with<B: Backend>(
    load_dir: &Path,
    predict_text: &str,
    export_dir: Option<&Path>,
    device: &B::Device,
) -> Result<String> {
    let translator = Translator::<B>::load(load_dir, device)?;

    if let Some(export_dir) = export_dir {
        let src_tokens = translator.encode_source(predict_text, device);
        export_encoder_attention(&translator.model, src_tokens, export_dir)?;
    }

    translator.translate(predict_text, device)
}

/// バックエンドを選択して推論実行
pub fn run_translation_inference(
    backend_name: &str,
    load_dir: &Path,
    predict_text: &str,
    export_dir: Option<&Path>,
) -> Result<String> {
    match backend_name {
        "wgpu" => {
            let device = WgpuDevice::default();
            translate_with::<Wgpu>(load_dir, predict_text, export_dir, &device)
        }
        "ndarray" => {
            let device = Default::default();
            translate_with::<NdArray>(load_dir, predict_text, export_dir, &device)
        }
        "auto" => {
            // autoの場合はWGPUを試し、失敗したらNdArrayにフォールバック
            tracing::info!("バックエンド: 自動選択中...");
            let wgpu_result = std::panic::catch_unwind(|| {
                let device = WgpuDevice::default();
                translate_with::<Wgpu>(load_dir, predict_text, export_dir, &device)
            });

            match wgpu_result {
                Ok(Ok(translation)) => {
                    tracing::info!("バックエンド: WGPU（自動選択）");
                    Ok(translation)
                }
                _ => {
                    tracing::info!("バックエンド: NdArray（WGPU利用不可のためフォールバック）");
                    let device = Default::default();
                    translate_with::<NdArray>(load_dir, predict_text, export_dir, &device)
                }
            }
        }
        _ => Err(TranslatorError::Config(format!(
            "未対応のバックエンド: {}",
            backend_name
        ))),
    }
}
