use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use std::path::Path;

use transformer_translator::checkpoint::{
    load_model, load_model_with_config, load_vocabularies, read_manifest, save_checkpoint,
    CheckpointContents, CheckpointMetrics, MANIFEST_FILE, MODEL_FILE,
};
use transformer_translator::transformer::{Transformer, TransformerConfig};
use transformer_translator::vocabulary::Vocabulary;
use transformer_translator::TranslatorError;

type TestBackend = NdArray;
type ModelRecord = <Transformer<TestBackend> as Module<TestBackend>>::Record;

fn vocabularies() -> (Vocabulary, Vocabulary) {
    (
        Vocabulary::from_sentences(&["hello world", "good morning"]),
        Vocabulary::from_sentences(&["bonjour le monde", "bonjour"]),
    )
}

fn model_config(src_vocab: &Vocabulary, tgt_vocab: &Vocabulary) -> TransformerConfig {
    TransformerConfig::new(16, src_vocab.vocab_size(), tgt_vocab.vocab_size(), 6)
        .with_num_layers(2)
        .with_n_heads(4)
        .with_expansion_factor(2)
}

/// テスト用のチェックポイントを保存
fn save_test_checkpoint(
    dir: &Path,
    model: &Transformer<TestBackend>,
    config: &TransformerConfig,
    src_vocab: &Vocabulary,
    tgt_vocab: &Vocabulary,
) {
    save_checkpoint(
        dir,
        CheckpointContents {
            model,
            model_config: config,
            optimizer: None::<ModelRecord>,
            metrics: CheckpointMetrics {
                epoch: 3,
                train_loss: 1.25,
                val_loss: 1.5,
                train_bleu: 0.2,
                val_bleu: 0.15,
                train_nist: 1.1,
                val_nist: 0.9,
            },
            src_vocab,
            tgt_vocab,
        },
    )
    .expect("チェックポイント保存失敗");
}

/// テンソル間の近似一致を検証
fn assert_tensors_close(a: &Tensor<TestBackend, 3>, b: &Tensor<TestBackend, 3>, tolerance: f32) -> bool {
    let diff = (a.clone() - b.clone()).abs();
    let max_diff = diff
        .into_data()
        .iter::<f32>()
        .fold(0.0_f32, f32::max);
    max_diff < tolerance
}

#[test]
fn test_checkpoint_roundtrip_ndarray() {
    println!("=== テスト: チェックポイント保存/読み込み（NdArray） ===");

    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let (src_vocab, tgt_vocab) = vocabularies();
    let config = model_config(&src_vocab, &tgt_vocab);
    let model = config.init::<TestBackend>(&device).unwrap();

    let src_tokens =
        Tensor::<TestBackend, 1, Int>::from_data([4i64, 5, 3, 0, 0, 0], &device).reshape([1, 6]);
    let tgt_tokens =
        Tensor::<TestBackend, 1, Int>::from_data([2i64, 4, 5, 3, 0, 0], &device).reshape([1, 6]);

    // 保存前の出力
    let output_before = model
        .forward(src_tokens.clone(), tgt_tokens.clone())
        .unwrap();

    save_test_checkpoint(dir.path(), &model, &config, &src_vocab, &tgt_vocab);
    assert!(dir.path().join(MODEL_FILE).exists());
    assert!(dir.path().join(MANIFEST_FILE).exists());
    assert!(!dir.path().join(".staging").exists());

    // 読み込み後の出力
    let (loaded_model, manifest) =
        load_model::<TestBackend>(dir.path(), &device).expect("モデル読み込み失敗");
    let output_after = loaded_model.forward(src_tokens, tgt_tokens).unwrap();

    assert!(
        assert_tensors_close(&output_before, &output_after, 1e-5),
        "保存前後の出力が一致しません（許容誤差: 1e-5）"
    );
    assert_eq!(manifest.metrics.epoch, 3);
    assert_eq!(manifest.metrics.val_bleu, 0.15);
    println!("✓ 保存前後の出力が一致しました");
}

#[test]
fn test_vocabularies_are_saved() {
    println!("=== テスト: 語彙の保存 ===");

    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let (src_vocab, tgt_vocab) = vocabularies();
    let config = model_config(&src_vocab, &tgt_vocab);
    let model = config.init::<TestBackend>(&device).unwrap();

    save_test_checkpoint(dir.path(), &model, &config, &src_vocab, &tgt_vocab);

    let (loaded_src, loaded_tgt) = load_vocabularies(dir.path()).unwrap();
    assert_eq!(loaded_src, src_vocab);
    assert_eq!(loaded_tgt, tgt_vocab);

    let manifest = read_manifest(dir.path()).unwrap();
    assert_eq!(manifest.model.embed_dim, 16);
    assert_eq!(manifest.parameter_shapes.len(), config.parameter_shapes().len());
    assert!(manifest
        .parameter_shapes
        .iter()
        .any(|shape| shape.name == "decoder.fc_out.weight"
            && shape.shape == vec![16, tgt_vocab.vocab_size()]));
    println!("✓ 語彙とテンソル形状を保存");
}

#[test]
fn test_shape_mismatch_names_tensor() {
    println!("=== テスト: 形状不一致の検出 ===");

    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let (src_vocab, tgt_vocab) = vocabularies();
    let config = model_config(&src_vocab, &tgt_vocab);
    let model = config.init::<TestBackend>(&device).unwrap();

    save_test_checkpoint(dir.path(), &model, &config, &src_vocab, &tgt_vocab);

    // ターゲット語彙が1語多い構成で読み込む
    let wider = TransformerConfig::new(
        16,
        src_vocab.vocab_size(),
        tgt_vocab.vocab_size() + 1,
        6,
    )
    .with_num_layers(2)
    .with_n_heads(4)
    .with_expansion_factor(2);

    let result = load_model_with_config::<TestBackend>(dir.path(), &wider, &device);
    match result {
        Err(TranslatorError::ShapeMismatch { tensor, expected, found }) => {
            assert_eq!(tensor, "decoder.embedding.weight");
            assert_eq!(expected, vec![tgt_vocab.vocab_size() + 1, 16]);
            assert_eq!(found, vec![tgt_vocab.vocab_size(), 16]);
            println!("✓ 不一致テンソル: {}", tensor);
        }
        Err(other) => panic!("ShapeMismatch 以外のエラー: {}", other),
        Ok(_) => panic!("形状不一致が検出されませんでした"),
    }
}
