use crate::checkpoint::{
    load_model_with_config, load_optimizer_record, load_vocabularies, read_manifest,
    save_checkpoint, CheckpointContents, CheckpointMetrics,
};
use crate::config::{ExperimentConfig, LossKind, OptimizerKind, TrainSettings};
use crate::data::{ParallelCorpus, TranslationBatcher, TranslationDataset};
use crate::error::Result;
use crate::logger::{metrics, MetricSink, MultiSink};
use crate::metrics::{save_metrics, TrainingMetrics};
use crate::optim;
use crate::scoring::batch_scores;
use crate::transformer::{Transformer, TransformerConfig};
use crate::vocabulary::{Vocabulary, PAD_ID};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::path::PathBuf;

// ===== 損失関数 =====

/// probabilities: [N, vocab]（Decoderのsoftmax出力）、targets: [N]
///
/// cross-entropy はBurnの交差エントロピー（入力をロジットとして扱う）、
/// negative-log は入力をそのまま使い -p[target] を平均する。いずれもPADは無視する。
pub fn compute_loss<B: Backend>(
    kind: LossKind,
    label_smoothing: f32,
    probabilities: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let device = probabilities.device();

    match kind {
        LossKind::CrossEntropy => {
            let smoothing = (label_smoothing > 0.0).then_some(label_smoothing);
            CrossEntropyLossConfig::new()
                .with_pad_tokens(Some(vec![PAD_ID]))
                .with_smoothing(smoothing)
                .init(&device)
                .forward(probabilities, targets)
        }
        LossKind::NegativeLog => {
            let picked = probabilities
                .gather(1, targets.clone().unsqueeze_dim(1))
                .squeeze::<1>(1);
            let mask = targets.not_equal_elem(PAD_ID as i64).float();
            let count = mask.clone().sum().clamp_min(1.0);

            (picked * mask).sum().neg() / count
        }
    }
}

fn loss_name(kind: LossKind) -> &'static str {
    match kind {
        LossKind::CrossEntropy => "cross-entropy",
        LossKind::NegativeLog => "negative-log",
    }
}

/// 1エポック分の平均値
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub bleu: f64,
    pub nist: f64,
}

#[derive(Default)]
struct StatsAccumulator {
    loss: f64,
    bleu: f64,
    nist: f64,
    batches: usize,
}

impl StatsAccumulator {
    fn add(&mut self, loss: f64, bleu: f64, nist: f64) {
        self.loss += loss;
        self.bleu += bleu;
        self.nist += nist;
        self.batches += 1;
    }

    fn average(&self) -> EpochStats {
        if self.batches == 0 {
            return EpochStats::default();
        }
        let n = self.batches as f64;
        EpochStats {
            loss: self.loss / n,
            bleu: self.bleu / n,
            nist: self.nist / n,
        }
    }
}

/// 1エポックの訓練（Teacher Forcing）
pub fn train_epoch<B: AutodiffBackend, O: Optimizer<Transformer<B>, B>>(
    mut model: Transformer<B>,
    optimizer: &mut O,
    dataset: &TranslationDataset,
    settings: &TrainSettings,
    shuffle_seed: u64,
    device: &B::Device,
) -> Result<(Transformer<B>, EpochStats)> {
    let batcher = TranslationBatcher::<B>::new(device.clone());
    let mut stats = StatsAccumulator::default();

    for indices in dataset.batch_indices(settings.batch_size, Some(shuffle_seed)) {
        let batch = batcher.batch_from(dataset, &indices);

        // フォワードパス
        let output = model.forward(batch.source, batch.decoder_input)?;
        let [batch_size, target_len, vocab_size] = output.dims();

        // 損失計算
        let loss = compute_loss(
            settings.loss_function,
            settings.label_smoothing,
            output.clone().reshape([batch_size * target_len, vocab_size]),
            batch
                .decoder_target
                .clone()
                .reshape([batch_size * target_len]),
        );
        let (bleu, nist) = batch_scores(output, batch.decoder_target);

        // バックプロパゲーション
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);

        // パラメータ更新（クリッピングはオプティマイザ側で適用）
        model = optimizer.step(settings.learning_rate, model, grads);

        stats.add(loss.into_scalar().elem::<f64>(), bleu, nist);
    }

    Ok((model, stats.average()))
}

/// 検証（Dropout無効、勾配なし）
pub fn validate_epoch<B: Backend>(
    model: &Transformer<B>,
    dataset: &TranslationDataset,
    settings: &TrainSettings,
    device: &B::Device,
) -> Result<EpochStats> {
    let batcher = TranslationBatcher::<B>::new(device.clone());
    let mut stats = StatsAccumulator::default();

    for indices in dataset.batch_indices(settings.batch_size, None) {
        let batch = batcher.batch_from(dataset, &indices);

        let output = model.forward(batch.source, batch.decoder_input)?;
        let [batch_size, target_len, vocab_size] = output.dims();

        let loss = compute_loss(
            settings.loss_function,
            settings.label_smoothing,
            output.clone().reshape([batch_size * target_len, vocab_size]),
            batch
                .decoder_target
                .clone()
                .reshape([batch_size * target_len]),
        );
        let (bleu, nist) = batch_scores(output, batch.decoder_target);

        stats.add(loss.into_scalar().elem::<f64>(), bleu, nist);
    }

    Ok(stats.average())
}

// ===== 早期終了 =====

/// エポック終了時の判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// 検証BLEUが改善した（チェックポイントを保存する）
    Improved,
    /// 改善なし
    NoImprovement { patience_counter: usize },
    /// patienceに達した
    Stop,
}

/// 最良スコアとpatienceの状態
#[derive(Debug, Clone)]
pub struct TrainingSession {
    best_val_bleu: Option<f64>,
    patience_counter: usize,
    patience: usize,
    improvement_margin: f64,
    history: Vec<CheckpointMetrics>,
}

impl TrainingSession {
    pub fn new(patience: usize, improvement_margin: f64) -> Self {
        Self {
            best_val_bleu: None,
            patience_counter: 0,
            patience,
            improvement_margin,
            history: Vec::new(),
        }
    }

    /// チェックポイントから再開する場合の最良スコア
    pub fn with_best_val_bleu(mut self, best_val_bleu: f64) -> Self {
        self.best_val_bleu = Some(best_val_bleu);
        self
    }

    /// エポックの結果を記録し、改善・継続・終了を判定する
    pub fn observe(&mut self, metrics: CheckpointMetrics) -> EpochOutcome {
        let val_bleu = metrics.val_bleu;
        self.history.push(metrics);

        // 最初のエポックは常に保存する
        let improved = match self.best_val_bleu {
            Some(best) => val_bleu > best + self.improvement_margin,
            None => true,
        };
        if improved {
            self.best_val_bleu = Some(val_bleu);
            self.patience_counter = 0;
            return EpochOutcome::Improved;
        }

        self.patience_counter += 1;
        if self.patience_counter >= self.patience {
            EpochOutcome::Stop
        } else {
            EpochOutcome::NoImprovement {
                patience_counter: self.patience_counter,
            }
        }
    }

    pub fn best_val_bleu(&self) -> Option<f64> {
        self.best_val_bleu
    }

    pub fn patience_counter(&self) -> usize {
        self.patience_counter
    }

    pub fn history(&self) -> &[CheckpointMetrics] {
        &self.history
    }
}

// ===== 訓練ループ =====

/// 訓練に必要なもの一式
pub struct Trainer<B: AutodiffBackend> {
    config: ExperimentConfig,
    model_config: TransformerConfig,
    src_vocab: Vocabulary,
    tgt_vocab: Vocabulary,
    train_set: TranslationDataset,
    val_set: TranslationDataset,
    checkpoint_dir: PathBuf,
    device: B::Device,
}

/// 訓練結果
#[derive(Debug)]
pub struct TrainingReport<B: AutodiffBackend> {
    /// 最終エポック時点のモデル（最良モデルはチェックポイント側）
    pub model: Transformer<B>,
    pub metrics: TrainingMetrics,
    pub checkpoint_dir: PathBuf,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// コーパスを読み込み、語彙・データセット・モデル構成を準備する
    pub fn new(config: ExperimentConfig, device: B::Device) -> Result<Self> {
        let data_settings = config.data_settings()?;
        let corpus = ParallelCorpus::load(data_settings)?;

        // 再開時は保存済みの語彙を使う
        let (src_vocab, tgt_vocab) = match config.checkpoint.resume_from() {
            Some(dir) => load_vocabularies(&dir)?,
            None => corpus.build_vocabularies(),
        };
        tracing::info!(
            "語彙サイズ: ソース {} / ターゲット {}",
            src_vocab.vocab_size(),
            tgt_vocab.vocab_size()
        );

        let dataset = TranslationDataset::new(
            &corpus,
            &src_vocab,
            &tgt_vocab,
            config.model.max_seq_length,
        );
        let (train_set, val_set) =
            dataset.split(data_settings.train_fraction, config.train.seed);
        tracing::info!(
            "訓練サンプル数: {} / 検証サンプル数: {}",
            train_set.len(),
            val_set.len()
        );

        let model_config =
            config.transformer_config(train_set.src_vocab_size(), train_set.tgt_vocab_size());
        let checkpoint_dir = config
            .checkpoint
            .directory
            .join(format!("{}_latest", config.logger.logger_name));

        Ok(Self {
            config,
            model_config,
            src_vocab,
            tgt_vocab,
            train_set,
            val_set,
            checkpoint_dir,
            device,
        })
    }

    /// オプティマイザを選んで訓練を実行する
    pub fn fit(&self, sink: &mut dyn MetricSink) -> Result<TrainingReport<B>> {
        let settings = &self.config.train;
        match settings.optimizer {
            OptimizerKind::Adam => self.run(optim::adam(settings), sink),
            OptimizerKind::AdamW => self.run(optim::adam_w(settings), sink),
            OptimizerKind::RAdam => self.run(optim::radam(settings), sink),
        }
    }

    fn run<O: Optimizer<Transformer<B>, B>>(
        &self,
        mut optimizer: O,
        sink: &mut dyn MetricSink,
    ) -> Result<TrainingReport<B>> {
        let settings = &self.config.train;
        B::seed(settings.seed);

        let mut session = TrainingSession::new(settings.patience, settings.improvement_margin);
        let mut starting_epoch = 1;

        // モデルの初期化または再開
        let mut model = match self.config.checkpoint.resume_from() {
            Some(dir) => {
                let manifest = read_manifest(&dir)?;
                let model = load_model_with_config::<B>(&dir, &self.model_config, &self.device)?;
                if let Some(record) = load_optimizer_record::<B, O::Record>(&dir, &self.device)? {
                    optimizer = optimizer.load_record(record);
                }
                starting_epoch = manifest.metrics.epoch + 1;
                session = session.with_best_val_bleu(manifest.metrics.val_bleu);
                tracing::info!(
                    "チェックポイントから再開: {} (epoch {})",
                    dir.display(),
                    starting_epoch
                );
                model
            }
            None => self.model_config.init::<B>(&self.device)?,
        };

        let epochs = settings.epochs;
        let mut stopped_early = false;
        let mut epochs_run = 0;
        tracing::info!(
            "訓練開始: {}エポック（オプティマイザ: {}, 損失: {}）",
            epochs,
            optim::optimizer_name(settings.optimizer),
            loss_name(settings.loss_function)
        );

        for epoch in starting_epoch..=epochs {
            let (trained, train_stats) = train_epoch(
                model,
                &mut optimizer,
                &self.train_set,
                settings,
                settings.seed.wrapping_add(epoch as u64),
                &self.device,
            )?;
            model = trained;

            let valid_model = model.valid();
            let val_stats = validate_epoch(&valid_model, &self.val_set, settings, &self.device)?;
            epochs_run += 1;

            let epoch_metrics = CheckpointMetrics {
                epoch,
                train_loss: train_stats.loss,
                val_loss: val_stats.loss,
                train_bleu: train_stats.bleu,
                val_bleu: val_stats.bleu,
                train_nist: train_stats.nist,
                val_nist: val_stats.nist,
            };

            sink.log(&metrics([
                ("epoch", epoch as f64),
                ("train_loss", train_stats.loss),
                ("val_loss", val_stats.loss),
                ("train_bleu", train_stats.bleu),
                ("val_bleu", val_stats.bleu),
                ("train_nist", train_stats.nist),
                ("val_nist", val_stats.nist),
            ]));
            tracing::info!(
                "Epoch {}/{}: train_loss = {:.6}, val_loss = {:.6}, train_bleu = {:.4}, val_bleu = {:.4}, train_nist = {:.4}, val_nist = {:.4}",
                epoch,
                epochs,
                train_stats.loss,
                val_stats.loss,
                train_stats.bleu,
                val_stats.bleu,
                train_stats.nist,
                val_stats.nist
            );

            match session.observe(epoch_metrics.clone()) {
                EpochOutcome::Improved => {
                    save_checkpoint(
                        &self.checkpoint_dir,
                        CheckpointContents {
                            model: &model,
                            model_config: &self.model_config,
                            optimizer: Some(optimizer.to_record()),
                            metrics: epoch_metrics,
                            src_vocab: &self.src_vocab,
                            tgt_vocab: &self.tgt_vocab,
                        },
                    )?;
                }
                EpochOutcome::NoImprovement { patience_counter } => {
                    tracing::debug!(
                        "検証BLEUの改善なし ({}/{})",
                        patience_counter,
                        settings.patience
                    );
                }
                EpochOutcome::Stop => {
                    tracing::info!(
                        "{}エポック改善がないため訓練を打ち切ります",
                        settings.patience
                    );
                    stopped_early = true;
                    break;
                }
            }
        }

        let training_metrics = TrainingMetrics {
            history: session.history().to_vec(),
            best_val_bleu: session.best_val_bleu().unwrap_or(0.0),
            epochs_run,
            stopped_early,
            learning_rate: settings.learning_rate,
            batch_size: settings.batch_size,
            optimizer: optim::optimizer_name(settings.optimizer).to_string(),
            loss_function: loss_name(settings.loss_function).to_string(),
        };

        let logger = &self.config.logger;
        let run_dir = logger
            .log_dir
            .join(&logger.project_name)
            .join(&logger.logger_name);
        save_metrics(
            &run_dir,
            &training_metrics,
            &self.model_config,
            &self.checkpoint_dir,
        )?;

        Ok(TrainingReport {
            model,
            metrics: training_metrics,
            checkpoint_dir: self.checkpoint_dir.clone(),
        })
    }
}

/// 設定ファイルの内容で訓練を実行する（tracing + JSONL に記録）
pub fn train_from_config<B: AutodiffBackend>(
    config: ExperimentConfig,
    device: B::Device,
) -> Result<TrainingReport<B>> {
    let mut sink = MultiSink::from_settings(&config.logger);
    let trainer = Trainer::<B>::new(config, device)?;
    trainer.fit(&mut sink)
}
