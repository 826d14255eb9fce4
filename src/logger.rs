//! メトリクスの記録先
//!
//! `log` は値を返さず、書き込み失敗は警告ログに留める。

use crate::config::LoggerSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// メトリクス名 → 値
pub type Metrics = BTreeMap<String, f64>;

/// `[("train_loss", 0.5), ...]` からメトリクスを作る
pub fn metrics<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Metrics {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

pub trait MetricSink {
    fn log(&mut self, metrics: &Metrics);
}

/// tracingのイベントとして出力する
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log(&mut self, metrics: &Metrics) {
        let fields = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(target: "metrics", "{}", fields);
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    metrics: &'a Metrics,
}

/// 1回の `log` につき1行のJSONを追記する
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlSink {
    /// `<log_dir>/<project_name>/<logger_name>.jsonl`
    pub fn new(settings: &LoggerSettings) -> Self {
        let path = settings
            .log_dir
            .join(&settings.project_name)
            .join(format!("{}.jsonl", settings.logger_name));
        Self::at(path)
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match open_append(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("メトリクスファイルを開けません {}: {}", path.display(), e);
                None
            }
        };
        Self { path, file }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl MetricSink for JsonlSink {
    fn log(&mut self, metrics: &Metrics) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let record = JsonlRecord {
            timestamp: chrono::Local::now().to_rfc3339(),
            metrics,
        };
        let result = serde_json::to_string(&record)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(file, "{line}"));

        if let Err(e) = result {
            tracing::warn!("メトリクス書き込みエラー {}: {}", self.path.display(), e);
        }
    }
}

/// 複数の記録先へ同じメトリクスを流す
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl MultiSink {
    /// tracing + JSONL の標準構成
    pub fn from_settings(settings: &LoggerSettings) -> Self {
        let mut sink = Self::default();
        sink.push(TracingSink);
        sink.push(JsonlSink::new(settings));
        sink
    }

    pub fn push(&mut self, sink: impl MetricSink + 'static) {
        self.sinks.push(Box::new(sink));
    }
}

impl MetricSink for MultiSink {
    fn log(&mut self, metrics: &Metrics) {
        for sink in &mut self.sinks {
            sink.log(metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggerSettings {
            logger_name: "run".to_string(),
            project_name: "proj".to_string(),
            log_dir: dir.path().to_path_buf(),
        };

        let mut sink = JsonlSink::new(&settings);
        sink.log(&metrics([("train_loss", 1.5), ("val_loss", 2.0)]));
        sink.log(&metrics([("train_bleu", 0.25)]));

        let content = fs::read_to_string(dir.path().join("proj").join("run.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["train_loss"], 1.5);
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        // 親がファイルなので開けない
        let mut sink = JsonlSink::at(blocker.join("metrics.jsonl"));
        sink.log(&metrics([("val_bleu", 0.1)]));
    }
}
