//! Plain forward-only network executor, the classical-library adapter.
//!
//! Like a classical vision library's network reader, this backend does not
//! trust the model to describe its inputs: callers must pass every input
//! size, and inputs are named positionally (`input1`, `input2`, ...).

use std::path::Path;

use tract_onnx::prelude::*;
use tracing::{debug, info};

use super::tract::{blob_to_tvalue, convert_output, fact_dims, output_labels, TractPlan};
use crate::backend::{select_accelerator, InferenceStats, InferenceTimer};
use crate::error::InferenceError;
use crate::model_info::{strip_batch, ModelInfo};
use crate::tensor::{ImageTensor, InferenceOutput};
use crate::{InferenceBackend, Result};

/// Backend forwarding a network loaded from a single model file.
pub struct DnnBackend {
    plan: TractPlan,
    output_names: Vec<String>,
    model_info: ModelInfo,
    timer: InferenceTimer,
}

impl DnnBackend {
    /// Load a network.
    ///
    /// `input_sizes` holds one channel-first shape (batch excluded) per
    /// network input and must not be empty.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        use_gpu: bool,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Running network executor on: {}", path.display());

        if input_sizes.is_empty() {
            return Err(InferenceError::Config(
                "input sizes must be specified for the dnn backend".to_string(),
            ));
        }

        // No GPU target is compiled in.
        select_accelerator(use_gpu, &["CPU"]);

        let mut model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| InferenceError::ModelLoad(format!("Can't load the model {}: {}", path.display(), e)))?;

        let declared = model
            .input_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?
            .len();
        if declared == 0 {
            return Err(InferenceError::NoInputs(path.display().to_string()));
        }

        let batch_size = batch_size.max(1);
        let mut model_info = ModelInfo::new();

        for (idx, size) in input_sizes.iter().enumerate().take(declared) {
            let mut shape = vec![batch_size];
            shape.extend(size.iter().map(|&d| d.max(1) as usize));
            model
                .set_input_fact(idx, InferenceFact::dt_shape(f32::datum_type(), &shape[..]))
                .map_err(|e| InferenceError::ModelLoad(format!("Failed to set input shape: {}", e)))?;
            model_info.add_input(format!("input{}", idx + 1), size.clone(), batch_size);
        }

        let labels = output_labels(&model)?;
        let typed = model
            .into_typed()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to type model: {}", e)))?;

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
            debug!("Output layer {}: {:?}", name, shape);
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
            output_names,
            model_info,
            timer: InferenceTimer::new(),
        })
    }

    /// Names of the network's unconnected output layers.
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl InferenceBackend for DnnBackend {
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput> {
        if let Some(primary) = self.model_info.primary_input() {
            image.validate_against(primary)?;
        }

        self.timer.start();
        let input = blob_to_tvalue(&image.to_nchw())?;

        let outputs = self
            .plan
            .run(tvec![input])
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorElement;
    use pretty_assertions::assert_eq;
    use prost::Message;
    use std::path::PathBuf;
    use tract_onnx::pb;
    use tract_onnx::pb::tensor_proto::DataType;

    fn value_info(name: &str, elem_type: DataType, dims: &[i64]) -> pb::ValueInfoProto {
        let dim = dims
            .iter()
            .map(|&d| pb::tensor_shape_proto::Dimension {
                value: Some(pb::tensor_shape_proto::dimension::Value::DimValue(d)),
                ..Default::default()
            })
            .collect();
        pb::ValueInfoProto {
            name: name.to_string(),
            r#type: Some(pb::TypeProto {
                value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                    elem_type: elem_type as i32,
                    shape: Some(pb::TensorShapeProto { dim }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> pb::NodeProto {
        pb::NodeProto {
            op_type: op_type.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// 3x224x224 image to 1000 scores `y`, plus the input's shape as `s`.
    fn write_classifier(dir: &Path) -> PathBuf {
        let weights = pb::TensorProto {
            name: "w".to_string(),
            dims: vec![3, 1000],
            data_type: DataType::Float as i32,
            float_data: vec![1.0; 3000],
            ..Default::default()
        };
        let graph = pb::GraphProto {
            name: "classifier".to_string(),
            node: vec![
                node("GlobalAveragePool", &["x"], &["pooled"]),
                node("Flatten", &["pooled"], &["features"]),
                node("MatMul", &["features", "w"], &["y"]),
                node("Shape", &["x"], &["s"]),
            ],
            initializer: vec![weights],
            input: vec![value_info("x", DataType::Float, &[1, 3, 224, 224])],
            output: vec![
                value_info("y", DataType::Float, &[1, 1000]),
                value_info("s", DataType::Int64, &[4]),
            ],
            ..Default::default()
        };
        let model = pb::ModelProto {
            ir_version: 7,
            opset_import: vec![pb::OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            graph: Some(graph),
            ..Default::default()
        };

        let path = dir.join("classifier.onnx");
        std::fs::write(&path, model.encode_to_vec()).unwrap();
        path
    }

    #[test]
    fn test_classifier_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DnnBackend::from_file(write_classifier(dir.path()), false, 1, &[vec![3, 224, 224]]).unwrap();

        assert_eq!(backend.output_names().to_vec(), vec!["y".to_string(), "s".to_string()]);

        let info = backend.model_info();
        let primary = info.primary_input().unwrap();
        assert_eq!(primary.name, "input1");
        assert_eq!(primary.shape, vec![3, 224, 224]);
        assert_eq!(info.outputs()[0].name, "y");
        assert_eq!(info.outputs()[0].shape, vec![1000]);
    }

    #[test]
    fn test_classifier_inference() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend =
            DnnBackend::from_file(write_classifier(dir.path()), false, 1, &[vec![3, 224, 224]]).unwrap();

        let image = ImageTensor::from_hwc(vec![0.5; 224 * 224 * 3], 224, 224, 3).unwrap();
        let output = backend.infer(&image).unwrap();

        assert_eq!(output.shapes, vec![vec![1, 1000], vec![4]]);
        assert_eq!(output.tensors[0].len(), 1000);
        assert!(output.tensors[0].iter().all(|v| match *v {
            TensorElement::Float32(x) => (x - 1.5).abs() < 1e-4,
            _ => false,
        }));
        assert_eq!(
            output.tensors[1],
            vec![
                TensorElement::Int64(1),
                TensorElement::Int64(3),
                TensorElement::Int64(224),
                TensorElement::Int64(224),
            ]
        );
        assert_eq!(backend.stats().total_inferences, 1);
    }

    #[test]
    fn test_wrong_image_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend =
            DnnBackend::from_file(write_classifier(dir.path()), false, 1, &[vec![3, 224, 224]]).unwrap();

        let err = backend.infer(&ImageTensor::zeros(32, 32, 3)).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_requires_input_sizes() {
        let err = DnnBackend::from_file("model.onnx", false, 1, &[]).err().unwrap();
        assert!(matches!(err, InferenceError::Config(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let err = DnnBackend::from_file("/nonexistent/net.onnx", true, 1, &[vec![3, 416, 416]])
            .err()
            .unwrap();
        assert!(matches!(err, InferenceError::ModelLoad(_)));
        assert!(err.is_fatal());
    }
}
