//! Training metrics and history

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ContrastResult;

/// Scalars recorded for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    scalars: BTreeMap<String, f32>,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scalar(&mut self, name: &str, value: f32) {
        self.scalars.insert(name.to_string(), value);
    }

    pub fn get_scalar(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }

    pub fn all_scalars(&self) -> &BTreeMap<String, f32> {
        &self.scalars
    }
}

/// Per-step metric tracker for one epoch
#[derive(Debug)]
pub struct MetricTracker {
    current_metrics: TrainingMetrics,
    history: Vec<TrainingMetrics>,
    start_time: Instant,
}

impl Default for MetricTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricTracker {
    pub fn new() -> Self {
        Self {
            current_metrics: TrainingMetrics::new(),
            history: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_scalar(&mut self, name: &str, value: f32) {
        self.current_metrics.record_scalar(name, value);
    }

    /// Close the current step
    pub fn step(&mut self) {
        self.history.push(std::mem::take(&mut self.current_metrics));
    }

    pub fn current(&self) -> &TrainingMetrics {
        &self.current_metrics
    }

    pub fn history(&self) -> &[TrainingMetrics] {
        &self.history
    }

    pub fn num_steps(&self) -> usize {
        self.history.len()
    }

    /// Every recorded value of `name`, in step order
    pub fn values(&self, name: &str) -> Vec<f32> {
        self.history.iter().filter_map(|m| m.get_scalar(name)).collect()
    }

    pub fn mean(&self, name: &str) -> Option<f32> {
        let values = self.values(name);
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f32>() / values.len() as f32)
        }
    }

    pub fn total_time(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Summary of one finished epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub learning_rate: f32,
    pub steps: usize,
    pub train_loss: f32,
    pub contrastive_loss: f32,
    pub class_loss: f32,
    pub train_acc: f32,
    pub val_acc: f32,
    pub val_contrastive_loss: f32,
    pub duration_secs: f64,
    pub interrupted: bool,
}

/// Everything written to `metrics.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    /// Per-step global training loss, one list per epoch
    pub train_losses: Vec<Vec<f32>>,
    /// Per-step global training accuracy, one list per epoch
    pub train_accs: Vec<Vec<f32>>,
    /// Per-batch validation accuracy, one list per epoch
    pub test_accs: Vec<Vec<f32>>,
    pub epochs: Vec<EpochSummary>,
}

impl MetricsHistory {
    pub fn push_epoch(&mut self, tracker: &MetricTracker, test_accs: Vec<f32>, summary: EpochSummary) {
        self.train_losses.push(tracker.values("loss"));
        self.train_accs.push(tracker.values("acc"));
        self.test_accs.push(test_accs);
        self.epochs.push(summary);
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }

    pub async fn save(&self, path: &Path) -> ContrastResult<()> {
        tokio::fs::write(path, serde_json::to_string_pretty(self)?).await?;
        Ok(())
    }

    /// Previous history if the file exists
    pub async fn load(path: &Path) -> ContrastResult<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_metric_tracker() {
        let mut tracker = MetricTracker::new();
        for (loss, acc) in [(2.0, 0.25), (1.0, 0.75)] {
            tracker.record_scalar("loss", loss);
            tracker.record_scalar("acc", acc);
            tracker.step();
        }
        tracker.record_scalar("loss", 9.0);

        assert_eq!(tracker.num_steps(), 2);
        assert_eq!(tracker.values("loss"), vec![2.0, 1.0]);
        assert_eq!(tracker.mean("acc"), Some(0.5));
        assert_eq!(tracker.mean("missing"), None);
        assert_eq!(tracker.current().get_scalar("loss"), Some(9.0));
    }

    #[tokio::test]
    async fn test_history_file_io() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        assert_eq!(MetricsHistory::load(&path).await.unwrap(), None);

        let mut tracker = MetricTracker::new();
        tracker.record_scalar("loss", 1.5);
        tracker.record_scalar("acc", 0.5);
        tracker.step();

        let mut history = MetricsHistory::default();
        history.push_epoch(
            &tracker,
            vec![0.6, 0.7],
            EpochSummary { epoch: 0, train_loss: 1.5, ..Default::default() },
        );
        history.save(&path).await.unwrap();

        let loaded = MetricsHistory::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.train_losses, vec![vec![1.5]]);
        assert_eq!(loaded.last().unwrap().train_loss, 1.5);
    }
}
