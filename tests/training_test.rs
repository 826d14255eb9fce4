use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use std::fs;
use std::path::Path;

use transformer_translator::checkpoint::{read_manifest, MODEL_FILE, OPTIMIZER_FILE};
use transformer_translator::config::ExperimentConfig;
use transformer_translator::inference::Translator;
use transformer_translator::training::train_from_config;

type TrainingBackend = Autodiff<NdArray>;

const PAIRS: &str = "\
# english\tfrench
hello\tbonjour
hello world\tbonjour le monde
good morning\tbonjour
good night\tbonne nuit
thank you\tmerci
thank you very much\tmerci beaucoup
see you soon\ta bientot
the cat sleeps\tle chat dort
the dog runs\tle chien court
i am happy\tje suis content
we are here\tnous sommes ici
this sentence has far too many words to keep\tcette phrase est trop longue
";

/// 一時ディレクトリ内で完結する設定を作る
fn test_config(root: &Path, optimizer: &str, loss: &str, epochs: usize, checkpoint: &str) -> ExperimentConfig {
    let yaml = format!(
        r#"
model:
  hidden_size: 8
  num_layers: 1
  expansion_factor: 2
  n_heads: 2
  max_seq_length: 6
  activation: relu
  norm_first: false
  relative_attention: false
  dropout: 0.1
train:
  batch_size: 4
  epochs: {epochs}
  optimizer: {optimizer}
  loss_function: {loss}
  label_smoothing: 0.1
  use_gradient_clipping: true
  learning_rate: 0.001
logger:
  logger_name: tiny
  project_name: tests
  log_dir: {log_dir}
checkpoint:
  checkpoint: {checkpoint}
  directory: {checkpoint_dir}
data:
  source_path: {data}
  train_fraction: 0.75
"#,
        log_dir = root.join("runs").display(),
        checkpoint_dir = root.join("checkpoints").display(),
        data = root.join("pairs.tsv").display(),
    );
    ExperimentConfig::from_yaml_str(&yaml).expect("設定の読み込み失敗")
}

#[test]
fn test_tiny_training_run_writes_checkpoint() {
    println!("=== テスト: 小規模訓練とチェックポイント ===");

    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("pairs.tsv"), PAIRS).unwrap();
    let config = test_config(root.path(), "adam", "cross-entropy", 2, "none");

    let report = train_from_config::<TrainingBackend>(config, Default::default())
        .expect("訓練失敗");

    assert_eq!(report.metrics.epochs_run, 2);
    assert_eq!(report.metrics.history.len(), 2);
    assert!(report.metrics.history.iter().all(|m| m.train_loss.is_finite()));
    println!("✓ 2エポック実行");

    // 初回エポックは必ず保存される
    let checkpoint_dir = report.checkpoint_dir.clone();
    assert!(checkpoint_dir.join(MODEL_FILE).exists());
    assert!(checkpoint_dir.join(OPTIMIZER_FILE).exists());
    let manifest = read_manifest(&checkpoint_dir).unwrap();
    assert!(manifest.metrics.epoch >= 1);

    // メトリクスはエポックごとに1行
    let jsonl = fs::read_to_string(root.path().join("runs/tests/tiny.jsonl")).unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    assert!(root.path().join("runs/tests/tiny/metrics.json").exists());
    assert!(root.path().join("runs/tests/tiny/README.md").exists());
    println!("✓ チェックポイントとメトリクスを保存");

    // 保存したモデルで推論
    let device = Default::default();
    let translator = Translator::<NdArray>::load(&checkpoint_dir, &device).unwrap();
    let translation = translator.translate("hello world", &device).unwrap();
    println!("✓ 推論結果: {:?}", translation);
}

#[test]
fn test_resume_continues_after_saved_epoch() {
    println!("=== テスト: チェックポイントからの再開 ===");

    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("pairs.tsv"), PAIRS).unwrap();

    let first = train_from_config::<TrainingBackend>(
        test_config(root.path(), "adamW", "cross-entropy", 1, "none"),
        Default::default(),
    )
    .expect("訓練失敗");
    let saved_epoch = read_manifest(&first.checkpoint_dir).unwrap().metrics.epoch;
    assert_eq!(saved_epoch, 1);

    let resume_from = first.checkpoint_dir.display().to_string();
    let resumed = train_from_config::<TrainingBackend>(
        test_config(root.path(), "adamW", "cross-entropy", 3, &resume_from),
        Default::default(),
    )
    .expect("再開後の訓練失敗");

    let epochs: Vec<usize> = resumed.metrics.history.iter().map(|m| m.epoch).collect();
    assert_eq!(epochs.first(), Some(&2));
    assert!(epochs.len() <= 2);
    println!("✓ 再開後のエポック: {:?}", epochs);
}

#[test]
fn test_radam_with_negative_log_loss() {
    println!("=== テスト: RAdam + negative-log ===");

    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("pairs.tsv"), PAIRS).unwrap();
    let config = test_config(root.path(), "radam", "negative-log", 1, "none");

    let report = train_from_config::<TrainingBackend>(config, Default::default())
        .expect("訓練失敗");

    assert_eq!(report.metrics.optimizer, "RAdam");
    assert_eq!(report.metrics.loss_function, "negative-log");
    // negative-log は -p の平均なので [-1, 0]
    let loss = report.metrics.history[0].train_loss;
    assert!((-1.0..=0.0).contains(&loss), "loss = {}", loss);
    println!("✓ train_loss = {:.6}", loss);
}
