//! Append-only sample store for one session
//!
//! Samples are kept in arrival order and addressed by index. The store also
//! owns the two session cursors (`trained_until`, `predicted_until`) so the
//! `0 <= cursor <= len` invariant is enforced in one place.

use super::error::{PipelineError, PipelineResult};
use super::persistence::SampleSink;
use super::types::Sample;
use ndarray::Array2;
use std::ops::Range;

#[derive(Debug, Default)]
pub struct SampleStore {
    samples: Vec<Sample>,
    trained_until: usize,
    predicted_until: usize,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Append a sample without validation
    pub fn append(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Validate arity and finiteness, then append
    pub fn push_checked(
        &mut self,
        sample: Sample,
        feature_arity: usize,
        target_arity: usize,
    ) -> PipelineResult<()> {
        if sample.features.len() != feature_arity {
            return Err(PipelineError::Ingestion(format!(
                "sample at {} has {} features, expected {}",
                sample.timestamp_ms,
                sample.features.len(),
                feature_arity
            )));
        }
        if sample.targets.len() != target_arity {
            return Err(PipelineError::Ingestion(format!(
                "sample at {} has {} targets, expected {}",
                sample.timestamp_ms,
                sample.targets.len(),
                target_arity
            )));
        }
        if sample
            .features
            .iter()
            .chain(sample.targets.iter())
            .any(|v| !v.is_finite())
        {
            return Err(PipelineError::Ingestion(format!(
                "sample at {} contains non-finite values",
                sample.timestamp_ms
            )));
        }
        self.append(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Read-only view of `[from, to)`, clamped to the current length
    pub fn window(&self, from: usize, to: usize) -> &[Sample] {
        let to = to.min(self.samples.len());
        let from = from.min(to);
        &self.samples[from..to]
    }

    /// Range of samples to train on
    ///
    /// `[trained_until, len)` when it fits in `max_samples`, otherwise the
    /// most recent `max_samples` samples.
    pub fn training_window(&self, trained_until: usize, len: usize, max_samples: usize) -> Range<usize> {
        let len = len.min(self.samples.len());
        let from = trained_until.min(len);
        if len - from > max_samples {
            len - max_samples..len
        } else {
            from..len
        }
    }

    /// Feature matrix for a range, each value divided by `scale`
    pub fn features(&self, range: Range<usize>, scale: f64) -> PipelineResult<Array2<f64>> {
        let window = self.window(range.start, range.end);
        let cols = window.first().map(|s| s.features.len()).unwrap_or(0);
        stack_rows(window.iter().map(|s| s.features.as_slice()), window.len(), cols)
            .map(|x| x / scale)
    }

    pub fn targets(&self, range: Range<usize>) -> PipelineResult<Array2<f64>> {
        let window = self.window(range.start, range.end);
        let cols = window.first().map(|s| s.targets.len()).unwrap_or(0);
        stack_rows(window.iter().map(|s| s.targets.as_slice()), window.len(), cols)
    }

    /// Attach prediction rows to samples starting at `from`
    pub fn record_predictions(&mut self, from: usize, predictions: &Array2<f64>) {
        for (offset, row) in predictions.rows().into_iter().enumerate() {
            if let Some(sample) = self.samples.get_mut(from + offset) {
                sample.prediction = Some(row.to_vec());
            }
        }
    }

    pub fn trained_until(&self) -> usize {
        self.trained_until
    }

    pub fn predicted_until(&self) -> usize {
        self.predicted_until
    }

    /// Move the training cursor forward; never backwards, never past `len`
    pub fn advance_trained(&mut self, to: usize) {
        self.trained_until = self.trained_until.max(to.min(self.samples.len()));
    }

    /// Move the prediction cursor forward; never backwards, never past `len`
    pub fn advance_predicted(&mut self, to: usize) {
        self.predicted_until = self.predicted_until.max(to.min(self.samples.len()));
    }

    /// Empty the store and reset both cursors (new session)
    pub fn clear(&mut self) {
        self.samples.clear();
        self.trained_until = 0;
        self.predicted_until = 0;
    }

    /// Hand the ordered sample sequence to a storage collaborator
    pub async fn persist(&self, sink: &mut dyn SampleSink) -> PipelineResult<()> {
        sink.persist(&self.samples).await
    }

    /// Replace the contents with the most recent session from a sink
    ///
    /// Cursors start at zero so loaded samples are predicted and trained on
    /// like freshly ingested ones.
    pub async fn load(&mut self, sink: &mut dyn SampleSink) -> PipelineResult<()> {
        let samples = sink.load().await?;
        self.clear();
        self.samples = samples;
        Ok(())
    }
}

/// Row-major `rows x cols` matrix; ragged rows are a shape error
fn stack_rows<'a>(
    values: impl Iterator<Item = &'a [f64]>,
    rows: usize,
    cols: usize,
) -> PipelineResult<Array2<f64>> {
    let mut data = Vec::with_capacity(rows * cols);
    for row in values {
        if row.len() != cols {
            return Err(PipelineError::Configuration(format!(
                "row of length {} in a matrix with {} columns",
                row.len(),
                cols
            )));
        }
        data.extend_from_slice(row);
    }
    Ok(Array2::from_shape_vec((rows, cols), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::persistence::JsonSnapshotSink;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn make_sample(i: i64) -> Sample {
        Sample::new(1000 + i, vec![i as f64; 4], vec![i as f64 * 0.5])
    }

    fn filled(n: i64) -> SampleStore {
        let mut store = SampleStore::new();
        for i in 0..n {
            store.append(make_sample(i));
        }
        store
    }

    #[test]
    fn test_append_preserves_order() {
        let store = filled(5);
        assert_eq!(store.len(), 5);
        let ts: Vec<i64> = store.samples().iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn test_push_checked_rejects_bad_samples() {
        let mut store = SampleStore::new();
        let wrong_features = Sample::new(1, vec![1.0, 2.0], vec![0.0]);
        assert!(matches!(
            store.push_checked(wrong_features, 4, 1),
            Err(PipelineError::Ingestion(_))
        ));

        let nan = Sample::new(2, vec![1.0, f64::NAN, 0.0, 0.0], vec![0.0]);
        assert!(store.push_checked(nan, 4, 1).is_err());

        let wrong_targets = Sample::new(3, vec![0.0; 4], vec![0.0, 1.0]);
        assert!(store.push_checked(wrong_targets, 4, 1).is_err());

        assert!(store.push_checked(make_sample(4), 4, 1).is_ok());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_window_is_clamped() {
        let store = filled(10);
        assert_eq!(store.window(2, 5).len(), 3);
        assert_eq!(store.window(8, 50).len(), 2);
        assert!(store.window(20, 30).is_empty());
    }

    #[test]
    fn test_training_window_within_limit() {
        let store = filled(50);
        assert_eq!(store.training_window(0, 50, 1000), 0..50);
        assert_eq!(store.training_window(30, 50, 1000), 30..50);
    }

    #[test]
    fn test_training_window_keeps_most_recent() {
        let store = filled(50);
        assert_eq!(store.training_window(0, 50, 20), 30..50);
        assert_eq!(store.training_window(10, 50, 40), 10..50);
        assert_eq!(store.training_window(9, 50, 40), 10..50);
    }

    #[test]
    fn test_features_are_scaled() {
        let store = filled(3);
        let x = store.features(1..3, 100.0).unwrap();
        assert_eq!(x.dim(), (2, 4));
        assert_eq!(x[[0, 0]], 0.01);
        let y = store.targets(1..3).unwrap();
        assert_eq!(y.as_slice(), Some(&[0.5, 1.0][..]));
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let mut store = filled(2);
        store.append(Sample::new(5, vec![1.0], vec![0.0]));
        assert!(matches!(
            store.features(0..3, 1.0),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_cursors_are_monotonic_and_bounded() {
        let mut store = filled(10);
        store.advance_trained(6);
        store.advance_trained(3);
        assert_eq!(store.trained_until(), 6);

        store.advance_predicted(100);
        assert_eq!(store.predicted_until(), 10);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut store = filled(10);
        store.advance_trained(10);
        store.advance_predicted(10);
        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.trained_until(), 0);
        assert_eq!(store.predicted_until(), 0);
    }

    #[test]
    fn test_record_predictions() {
        let mut store = filled(4);
        let preds = array![[9.0], [8.0]];
        store.record_predictions(2, &preds);
        assert_eq!(store.get(1).unwrap().prediction, None);
        assert_eq!(store.get(2).unwrap().prediction, Some(vec![9.0]));
        assert_eq!(store.get(3).unwrap().prediction, Some(vec![8.0]));
    }

    #[tokio::test]
    async fn test_persist_then_load_restores_exact_values() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonSnapshotSink::new(dir.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let mut store = SampleStore::new();
        for i in 0..500 {
            let features = (0..4).map(|_| rng.gen::<f64>() * 1000.0 - 500.0).collect();
            let targets = vec![rng.gen::<f64>() * 1e-3];
            let mut sample = Sample::new(i, features, targets);
            if i % 2 == 0 {
                sample.prediction = Some(vec![rng.gen::<f64>() * 1e6]);
            }
            store.append(sample);
        }
        store.advance_trained(300);
        store.persist(&mut sink).await.unwrap();

        let mut restored = SampleStore::new();
        restored.append(make_sample(99));
        restored.load(&mut sink).await.unwrap();

        assert_eq!(restored.samples(), store.samples());
        assert_eq!(restored.trained_until(), 0);
        assert_eq!(restored.predicted_until(), 0);
    }
}
