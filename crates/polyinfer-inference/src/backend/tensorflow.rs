//! TensorFlow graph backend, the graph-execution adapter.
//!
//! Frozen TensorFlow graphs are executed by tract. Their image input is
//! channel-last (NHWC); metadata reports it channel-first.

use std::path::{Path, PathBuf};

use tract_tensorflow::prelude::*;
use tracing::{debug, info};

use super::tract::{blob_to_tvalue, convert_output, fact_dims, output_labels, TractPlan};
use crate::backend::{select_accelerator, InferenceStats, InferenceTimer};
use crate::error::InferenceError;
use crate::model_info::{nhwc_to_chw, strip_batch, ModelInfo};
use crate::tensor::{ImageTensor, InferenceOutput};
use crate::{InferenceBackend, Result};

/// Graph file names looked up inside a model bundle directory.
const BUNDLE_GRAPH_FILES: [&str; 3] = ["frozen_inference_graph.pb", "frozen_graph.pb", "model.pb"];

/// Backend running TensorFlow graphs through tract.
pub struct TensorflowBackend {
    plan: TractPlan,
    input_name: String,
    output_names: Vec<String>,
    model_info: ModelInfo,
    timer: InferenceTimer,
}

impl TensorflowBackend {
    /// Load a frozen graph, or a bundle directory containing one.
    ///
    /// `input_sizes[0]`, when given, is the channel-first (C, H, W) size of
    /// the image input and pins its dynamic dimensions.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        use_gpu: bool,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        let graph_path = resolve_graph_path(path.as_ref())?;
        info!("Loading TensorFlow graph from: {}", graph_path.display());

        // tract executes on the CPU only.
        select_accelerator(use_gpu, &["CPU"]);

        let mut model = tract_tensorflow::tensorflow()
            .model_for_path(&graph_path)
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to load graph: {}", e)))?;

        let input_count = model
            .input_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .len();
        if input_count == 0 {
            return Err(InferenceError::NoInputs(graph_path.display().to_string()));
        }

        let batch_size = batch_size.max(1);
        if let Some(shape) = input_sizes.first().and_then(|size| nhwc_hint(batch_size, size)) {
            debug!("Pinning input shape to {:?} (NHWC)", shape);
            model
                .set_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), &shape[..]))
                .map_err(|e| InferenceError::ModelLoad(format!("Failed to set input shape: {}", e)))?;
        }

        let labels = output_labels(&model)?;
        let typed = model
            .into_typed()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to type model: {}", e)))?;

        let input_outlet = typed
            .input_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?[0];
        let input_name = typed.node(input_outlet.node).name.clone();
        let input_fact = typed
            .outlet_fact(input_outlet)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
        let input_shape = nhwc_to_chw(&fact_dims(input_fact));
        info!("Input {} reshaped to CHW {:?}", input_name, input_shape);

        let mut model_info = ModelInfo::new();
        model_info.add_input(&input_name, input_shape, batch_size);

        let mut output_names = Vec::new();
        for (outlet, name) in typed
            .output_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .iter()
            .zip(labels)
        {
            let fact = typed
                .outlet_fact(*outlet)
                .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
            let shape = strip_batch(&fact_dims(fact));
            debug!("Output {}: {:?}", name, shape);
            model_info.add_output(&name, shape, batch_size);
            output_names.push(name);
        }

        let plan = typed
            .into_optimized()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to optimize: {}", e)))?
            .into_runnable()
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?;

        Ok(Self {
            plan,
            input_name,
            output_names,
            model_info,
            timer: InferenceTimer::new(),
        })
    }

    /// Name of the graph's image input node.
    pub fn input_name(&self) -> &str {
        &self.input_name
    }
}

impl InferenceBackend for TensorflowBackend {
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput> {
        if let Some(primary) = self.model_info.primary_input() {
            image.validate_against(primary)?;
        }

        self.timer.start();
        let input = blob_to_tvalue(&image.to_nhwc())?;

        let outputs = self
            .plan
            .run(tvec![input])
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        if outputs.len() != self.output_names.len() {
            return Err(InferenceError::InferenceFailed(format!(
                "graph produced {} outputs, expected {}",
                outputs.len(),
                self.output_names.len()
            )));
        }

        let mut results = InferenceOutput::with_capacity(outputs.len());
        for output in outputs.iter() {
            let (tensor, shape) = convert_output(output)?;
            results.push(tensor, shape);
        }

        self.timer.stop();
        Ok(results)
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    fn stats(&self) -> InferenceStats {
        self.timer.stats()
    }
}

/// NHWC input shape for a (C, H, W) size hint. Dynamic entries become 1.
fn nhwc_hint(batch_size: usize, size: &[i64]) -> Option<[usize; 4]> {
    match *size {
        [c, h, w] => Some([batch_size, h.max(1) as usize, w.max(1) as usize, c.max(1) as usize]),
        _ => None,
    }
}

/// Find the graph file for a path that is either a file or a bundle directory.
fn resolve_graph_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if path.is_dir() {
        return BUNDLE_GRAPH_FILES
            .iter()
            .map(|name| path.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                InferenceError::ModelLoad(format!(
                    "no graph file ({}) in bundle {}",
                    BUNDLE_GRAPH_FILES.join(", "),
                    path.display()
                ))
            });
    }

    Err(InferenceError::ModelLoad(format!(
        "model path does not exist: {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nhwc_hint_clamps_dynamic_dims() {
        assert_eq!(nhwc_hint(2, &[3, 224, 224]), Some([2, 224, 224, 3]));
        assert_eq!(nhwc_hint(1, &[3, -1, -1]), Some([1, 1, 1, 3]));
        assert_eq!(nhwc_hint(1, &[0, 8, 8]), Some([1, 8, 8, 1]));
        assert_eq!(nhwc_hint(1, &[224, 224]), None);
    }

    #[test]
    fn test_resolve_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frozen_graph.pb"), b"").unwrap();

        let resolved = resolve_graph_path(dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("frozen_graph.pb"));
    }

    #[test]
    fn test_resolve_prefers_inference_graph() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.pb"), b"").unwrap();
        std::fs::write(dir.path().join("frozen_inference_graph.pb"), b"").unwrap();

        let resolved = resolve_graph_path(dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("frozen_inference_graph.pb"));
    }

    #[test]
    fn test_resolve_empty_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_graph_path(dir.path()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let err = TensorflowBackend::from_path("/nonexistent/graph.pb", false, 1, &[])
            .err()
            .unwrap();
        assert!(matches!(err, InferenceError::ModelLoad(_)));
        assert!(err.is_fatal());
    }
}
