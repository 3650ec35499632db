//! ONNX Runtime (ort) backend, the cross-framework adapter.

use std::path::Path;

use ort::ep::{self, ExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor};
use tracing::{debug, info};

use crate::backend::{select_accelerator, Accelerator, InferenceStats, InferenceTimer};
use crate::error::InferenceError;
use crate::model_info::{strip_batch, ModelInfo};
use crate::tensor::{tag_elements, ImageTensor, InferenceOutput, TensorElement};
use crate::{InferenceBackend, Result};

const CUDA_PROVIDER: &str = "CUDAExecutionProvider";
const TENSORRT_PROVIDER: &str = "TensorrtExecutionProvider";

/// Backend using ONNX Runtime.
pub struct OrtBackend {
    session: Session,
    input_names: Vec<String>,
    input_shapes: Vec<Vec<i64>>,
    input_types: Vec<Option<TensorElementType>>,
    output_names: Vec<String>,
    model_info: ModelInfo,
    accelerator: Accelerator,
    timer: InferenceTimer,
}

impl OrtBackend {
    /// Load a model from a file path.
    ///
    /// `input_sizes` optionally fixes dynamic dimensions of each input
    /// (channel-first, batch excluded).
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        use_gpu: bool,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading ONNX model from: {}", path.display());

        let bytes = std::fs::read(path)
            .map_err(|e| InferenceError::ModelLoad(format!("{}: {}", path.display(), e)))?;

        Self::from_bytes(&bytes, use_gpu, batch_size, input_sizes)
    }

    /// Load a model from bytes.
    pub fn from_bytes(
        bytes: &[u8],
        use_gpu: bool,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        debug!("Loading ONNX model from {} bytes", bytes.len());

        let (accelerator, providers) = execution_providers(use_gpu);

        let session = Session::builder()
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?
            .with_execution_providers(providers)
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?
            .commit_from_memory(bytes)
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        if session.inputs().is_empty() {
            return Err(InferenceError::NoInputs("ONNX session has no inputs".to_string()));
        }

        let batch_size = batch_size.max(1);
        let mut model_info = ModelInfo::new();
        let mut input_names = Vec::new();
        let mut input_shapes = Vec::new();
        let mut input_types = Vec::new();

        for (idx, input) in session.inputs().iter().enumerate() {
            let name = input.name().to_string();
            let mut shape: Vec<i64> = input
                .dtype()
                .tensor_shape()
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();

            if let Some(first) = shape.first_mut() {
                if *first < 0 {
                    *first = 1;
                }
            }
            if let Some(hint) = input_sizes.get(idx) {
                apply_size_hint(&mut shape, hint);
            }

            let dtype = input.dtype().tensor_type();
            debug!("Input {}: {} {:?} {:?}", idx, name, shape, dtype);

            model_info.add_input(&name, strip_batch(&shape), batch_size);
            input_names.push(name);
            input_shapes.push(shape);
            input_types.push(dtype);
        }

        let mut output_names = Vec::new();
        for output in session.outputs().iter() {
            let name = output.name().to_string();
            let shape: Vec<i64> = output
                .dtype()
                .tensor_shape()
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();

            debug!("Output: {} {:?}", name, shape);
            model_info.add_output(&name, strip_batch(&shape), batch_size);
            output_names.push(name);
        }

        debug!("Model inputs: {:?}", input_names);
        debug!("Model outputs: {:?}", output_names);

        Ok(Self {
            session,
            input_names,
            input_shapes,
            input_types,
            output_names,
            model_info,
            accelerator,
            timer: InferenceTimer::new(),
        })
    }

    /// Where the session ended up executing.
    pub fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }

    fn build_inputs(&self, image: &ImageTensor) -> Result<Vec<(String, SessionInputValue<'static>)>> {
        let blob = image.to_nchw();
        let shape: Vec<i64> = blob.shape().iter().map(|&s| s as i64).collect();
        let data: Vec<f32> = blob.iter().cloned().collect();

        let mut inputs: Vec<(String, SessionInputValue<'static>)> = Vec::with_capacity(self.input_names.len());
        let primary = Tensor::from_array((shape, data))
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        inputs.push((self.input_names[0].clone(), primary.into()));

        // Detection models such as RT-DETR take the original target size as a second input.
        if self.input_names.len() > 1 {
            let target = image.target_size();
            let mut shape = self.input_shapes[1].clone();
            if shape.iter().any(|&d| d <= 0) {
                shape = vec![1, 2];
            }

            let value: SessionInputValue<'static> = match self.input_types[1] {
                Some(TensorElementType::Int32) => {
                    let data: Vec<i32> = target.iter().map(|&v| v as i32).collect();
                    Tensor::from_array((shape, data))
                        .map_err(|e| InferenceError::InvalidInput(e.to_string()))?
                        .into()
                }
                _ => Tensor::from_array((shape, target.to_vec()))
                    .map_err(|e| InferenceError::InvalidInput(e.to_string()))?
                    .into(),
            };
            inputs.push((self.input_names[1].clone(), value));
        }

        Ok(inputs)
    }
}

impl InferenceBackend for OrtBackend {
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput> {
        if let Some(primary) = self.model_info.primary_input() {
            image.validate_against(primary)?;
        }

        self.timer.start();
        let ort_inputs = self.build_inputs(image)?;

        let outputs = self
            .session
            .run(ort_inputs)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let mut results = InferenceOutput::with_capacity(self.output_names.len());

        for name in &self.output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                InferenceError::OutputExtraction(format!("missing output '{}'", name))
            })?;
            let (tensor, shape) = convert_output(value)?;
            results.push(tensor, shape);
        }

        drop(outputs);
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

/// Decide providers for a new session.
///
/// XNNPACK always stays registered as the CPU provider; a GPU provider is
/// prepended only when the runtime reports it as available.
fn execution_providers(use_gpu: bool) -> (Accelerator, Vec<ExecutionProviderDispatch>) {
    let mut available = vec!["CPUExecutionProvider"];
    if use_gpu {
        if ep::CUDA::default().is_available().unwrap_or(false) {
            available.push(CUDA_PROVIDER);
        }
        if ep::TensorRT::default().is_available().unwrap_or(false) {
            available.push(TENSORRT_PROVIDER);
        }
    }

    let accelerator = select_accelerator(use_gpu, &available);
    let mut providers = Vec::new();
    match &accelerator {
        Accelerator::Gpu(name) if name == TENSORRT_PROVIDER => {
            providers.push(ep::TensorRT::default().build());
        }
        Accelerator::Gpu(_) => providers.push(ep::CUDA::default().build()),
        Accelerator::Cpu => {}
    }
    providers.push(ep::XNNPACK::default().build());

    (accelerator, providers)
}

/// Replace non-positive dims of a batch-first shape with a channel-first hint.
fn apply_size_hint(shape: &mut [i64], hint: &[i64]) {
    for (dim, &size) in shape.iter_mut().skip(1).zip(hint.iter()) {
        if *dim <= 0 && size > 0 {
            *dim = size;
        }
    }
}

fn convert_output(value: &DynValue) -> Result<(Vec<TensorElement>, Vec<i64>)> {
    let dtype = value
        .dtype()
        .tensor_type()
        .ok_or_else(|| InferenceError::OutputExtraction("output is not a tensor".to_string()))?;

    let (shape, tensor) = match dtype {
        TensorElementType::Float32 => {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
            (shape.to_vec(), tag_elements(data))
        }
        TensorElementType::Int32 => {
            let (shape, data) = value
                .try_extract_tensor::<i32>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
            (shape.to_vec(), tag_elements(data))
        }
        TensorElementType::Int64 => {
            let (shape, data) = value
                .try_extract_tensor::<i64>()
                .map_err(|e| InferenceError::OutputExtraction(e.to_string()))?;
            (shape.to_vec(), tag_elements(data))
        }
        other => return Err(InferenceError::unsupported_output(other)),
    };

    Ok((tensor, shape))
}
