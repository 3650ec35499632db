//! Runtime-free backend returning a fixed classification-shaped output.

use tracing::debug;

use crate::backend::{InferenceStats, InferenceTimer};
use crate::model_info::ModelInfo;
use crate::tensor::{ImageTensor, InferenceOutput, TensorElement};
use crate::{InferenceBackend, Result};

/// Number of classes the mock model scores.
pub const MOCK_CLASSES: usize = 1000;

/// Backend for tests and for running the pipeline without a model.
///
/// Declares one `input` of (3, 224, 224) and one `output` of (1000,). Every
/// call returns a uniform score over all classes.
#[derive(Debug)]
pub struct MockBackend {
    model_info: ModelInfo,
    timer: InferenceTimer,
    calls: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        let mut model_info = ModelInfo::new();
        model_info.add_input("input", vec![3, 224, 224], 1);
        model_info.add_output("output", vec![MOCK_CLASSES as i64], 1);

        Self {
            model_info,
            timer: InferenceTimer::new(),
            calls: 0,
        }
    }

    /// Number of `infer` calls made, including rejected ones.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput> {
        self.calls += 1;
        if let Some(primary) = self.model_info.primary_input() {
            image.validate_against(primary)?;
        }

        self.timer.start();
        debug!("Mock inference #{}", self.calls);

        let score = 1.0 / MOCK_CLASSES as f32;
        let mut output = InferenceOutput::with_capacity(1);
        output.push(
            vec![TensorElement::Float32(score); MOCK_CLASSES],
            vec![1, MOCK_CLASSES as i64],
        );

        self.timer.stop();
        Ok(output)
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    fn stats(&self) -> InferenceStats {
        self.timer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorType;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classification_output() {
        let mut backend = MockBackend::new();
        let output = backend.infer(&ImageTensor::zeros(224, 224, 3)).unwrap();

        assert_eq!(output.len(), 1);
        assert_eq!(output.shapes[0], vec![1, 1000]);
        assert_eq!(output.tensors[0].len(), 1000);
        assert!(output.tensors[0].iter().all(|v| v.dtype() == TensorType::Float32));
    }

    #[test]
    fn test_metadata() {
        let backend = MockBackend::new();
        let info = backend.model_info();

        assert_eq!(info.inputs()[0].name, "input");
        assert_eq!(info.inputs()[0].shape, vec![3, 224, 224]);
        assert_eq!(info.outputs()[0].shape, vec![1000]);
        assert_eq!(info.outputs()[0].batch_size, 1);
    }

    #[test]
    fn test_rejects_wrong_size_and_counts_calls() {
        let mut backend = MockBackend::new();
        assert!(backend.infer(&ImageTensor::zeros(100, 100, 3)).is_err());
        backend.infer(&ImageTensor::zeros(224, 224, 3)).unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(backend.stats().total_inferences, 1);
    }
}
