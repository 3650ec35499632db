//! Engine runtime compiling ONNX bytes into an optimized tract plan.
//!
//! Serialized "engines" for this runtime are plain ONNX models. Bindings are
//! the model inputs followed by its outputs. Execution reads the inputs out
//! of device memory, runs the plan on the host and writes every output back.

use std::io::Cursor;
use std::sync::Arc;

use tract_onnx::prelude::*;
use tracing::{debug, warn};

use super::device::Device;
use super::runtime::{binding_volume, BindingInfo, CompiledEngine, EngineDataType, EngineRuntime, ExecutionContext};
use crate::backend::tract::{fact_dims, slice_to_tvalue, TractPlan};
use crate::error::InferenceError;
use crate::tensor::TensorType;
use crate::Result;

/// Runtime for ONNX-serialized engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TractEngineRuntime;

impl EngineRuntime for TractEngineRuntime {
    type Engine = TractEngine;

    fn deserialize(&self, blob: &[u8]) -> Result<TractEngine> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(blob))
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to deserialize engine: {}", e)))?;

        let typed = model
            .into_typed()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to type engine: {}", e)))?;

        TractEngine::from_typed(typed)
    }
}

/// A compiled tract plan plus its binding table.
pub struct TractEngine {
    bindings: Vec<BindingInfo>,
    plan: Arc<TractPlan>,
}

impl TractEngine {
    /// Compile a typed model. Inputs become the leading bindings.
    pub fn from_typed(typed: TypedModel) -> Result<Self> {
        let mut bindings = Vec::new();

        let inputs = typed
            .input_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
        let outputs = typed
            .output_outlets()
            .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;

        for (outlets, is_input) in [(inputs, true), (outputs, false)] {
            for outlet in outlets {
                let fact = typed
                    .outlet_fact(*outlet)
                    .map_err(|e| InferenceError::ModelLoad(e.to_string()))?;
                let name = typed
                    .outlet_label(*outlet)
                    .map(str::to_string)
                    .unwrap_or_else(|| typed.node(outlet.node).name.clone());
                bindings.push(BindingInfo {
                    name,
                    dims: fact_dims(fact),
                    dtype: engine_data_type(fact.datum_type)?,
                    is_input,
                });
            }
        }
        debug!("Engine bindings: {:?}", bindings);

        let plan = typed
            .into_optimized()
            .map_err(|e| InferenceError::ModelLoad(format!("Failed to optimize engine: {}", e)))?
            .into_runnable()
            .map_err(|e| InferenceError::SessionCreate(e.to_string()))?;

        Ok(Self {
            bindings,
            plan: Arc::new(plan),
        })
    }
}

impl CompiledEngine for TractEngine {
    type Context = TractEngineContext;

    fn num_bindings(&self) -> usize {
        self.bindings.len()
    }

    fn binding(&self, index: usize) -> BindingInfo {
        self.bindings[index].clone()
    }

    /// A single profile whose minimum pins every dynamic dimension to 1.
    fn profile_min_dims(&self, profile: usize, binding: usize) -> Option<Vec<i64>> {
        if profile != 0 {
            return None;
        }
        self.bindings
            .get(binding)
            .map(|b| b.dims.iter().map(|&d| if d > 0 { d } else { 1 }).collect())
    }

    fn create_context(&self) -> Result<TractEngineContext> {
        Ok(TractEngineContext {
            active_dims: self.bindings.iter().map(|b| b.dims.clone()).collect(),
            bindings: self.bindings.clone(),
            plan: Arc::clone(&self.plan),
        })
    }
}

/// Execution state of a [`TractEngine`].
pub struct TractEngineContext {
    bindings: Vec<BindingInfo>,
    active_dims: Vec<Vec<i64>>,
    plan: Arc<TractPlan>,
}

impl TractEngineContext {
    fn execute<D: Device>(&self, device: &D, ptrs: &[D::Ptr]) -> Result<()> {
        if ptrs.len() != self.bindings.len() {
            return Err(InferenceError::InferenceFailed(format!(
                "{} buffers for {} bindings",
                ptrs.len(),
                self.bindings.len()
            )));
        }

        let mut inputs = TVec::new();
        for (index, binding) in self.bindings.iter().enumerate().filter(|(_, b)| b.is_input) {
            let dims = &self.active_dims[index];
            let shape: Vec<usize> = dims.iter().map(|&d| d.max(1) as usize).collect();
            let tensor_type = binding.tensor_type()?;

            let mut host = vec![0u8; binding_volume(dims) * tensor_type.byte_width()];
            device.copy_to_host(&mut host, ptrs[index])?;

            let value = match tensor_type {
                TensorType::Float32 => {
                    let data: Vec<f32> = host
                        .chunks_exact(4)
                        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    slice_to_tvalue(&shape, &data)?
                }
                TensorType::Int32 => {
                    let data: Vec<i32> = host
                        .chunks_exact(4)
                        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    slice_to_tvalue(&shape, &data)?
                }
                TensorType::Int64 => {
                    let data: Vec<i64> = host
                        .chunks_exact(8)
                        .map(|b| i64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                        .collect();
                    slice_to_tvalue(&shape, &data)?
                }
            };
            inputs.push(value);
        }

        let outputs = self
            .plan
            .run(inputs)
            .map_err(|e| InferenceError::InferenceFailed(e.to_string()))?;

        let output_bindings = self
            .bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_input);
        for ((index, binding), output) in output_bindings.zip(outputs.iter()) {
            let capacity = binding.byte_size()?;
            let bytes = tensor_bytes(output)?;
            let len = bytes.len().min(capacity);
            if bytes.len() > capacity {
                warn!(
                    "Output '{}' produced {} bytes, keeping the first {}",
                    binding.name,
                    bytes.len(),
                    capacity
                );
            }
            device.copy_to_device(ptrs[index], &bytes[..len])?;
        }

        Ok(())
    }
}

impl<D: Device> ExecutionContext<D> for TractEngineContext {
    fn set_binding_dimensions(&mut self, binding: usize, dims: &[i64]) -> bool {
        match self.active_dims.get_mut(binding) {
            Some(active) if active.len() == dims.len() => {
                *active = dims.to_vec();
                true
            }
            _ => false,
        }
    }

    fn enqueue(&mut self, device: &D, bindings: &[D::Ptr]) -> bool {
        match self.execute(device, bindings) {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine execution failed: {}", e);
                false
            }
        }
    }
}

fn engine_data_type(datum_type: DatumType) -> Result<EngineDataType> {
    Ok(match datum_type {
        DatumType::F32 => EngineDataType::Float,
        DatumType::F16 => EngineDataType::Half,
        DatumType::I8 => EngineDataType::Int8,
        DatumType::I32 => EngineDataType::Int32,
        DatumType::I64 | DatumType::TDim => EngineDataType::Int64,
        DatumType::U8 => EngineDataType::Uint8,
        DatumType::Bool => EngineDataType::Bool,
        other => {
            return Err(InferenceError::ModelLoad(format!(
                "engine binding type {:?} has no device representation",
                other
            )));
        }
    })
}

fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let extract = |e: TractError| InferenceError::OutputExtraction(e.to_string());
    Ok(match tensor.datum_type() {
        DatumType::F32 => tensor
            .as_slice::<f32>()
            .map_err(extract)?
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect(),
        DatumType::I32 => tensor
            .as_slice::<i32>()
            .map_err(extract)?
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect(),
        DatumType::I64 => tensor
            .as_slice::<i64>()
            .map_err(extract)?
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect(),
        DatumType::TDim => tensor
            .cast_to::<i64>()
            .map_err(extract)?
            .as_slice::<i64>()
            .map_err(extract)?
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect(),
        other => return Err(InferenceError::unsupported_output(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::engine::{EngineBackend, HostDevice};
    use crate::tensor::{ImageTensor, TensorElement};
    use crate::InferenceBackend;
    use pretty_assertions::assert_eq;

    /// Engine passing its image input straight through.
    fn passthrough_engine() -> TractEngine {
        let mut model = TypedModel::default();
        let source = model
            .add_source("images", TypedFact::dt_shape(f32::datum_type(), [1usize, 3, 2, 2]))
            .unwrap();
        model.set_output_outlets(&[source]).unwrap();
        TractEngine::from_typed(model).unwrap()
    }

    #[test]
    fn test_garbage_blob_is_rejected() {
        let err = TractEngineRuntime.deserialize(b"not an engine").err().unwrap();
        assert!(matches!(err, InferenceError::ModelLoad(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bindings_inputs_first() {
        let engine = passthrough_engine();
        assert_eq!(engine.num_bindings(), 2);
        assert!(engine.binding(0).is_input);
        assert!(!engine.binding(1).is_input);
        assert_eq!(engine.binding(0).dims, vec![1, 3, 2, 2]);
        assert_eq!(engine.binding(0).dtype, EngineDataType::Float);
    }

    #[test]
    fn test_binding_names_prefer_outlet_labels() {
        let mut model = TypedModel::default();
        let source = model
            .add_source("images", TypedFact::dt_shape(f32::datum_type(), [1usize, 3]))
            .unwrap();
        model.set_output_outlets(&[source]).unwrap();
        model.set_outlet_label(source, "logits".to_string()).unwrap();

        let engine = TractEngine::from_typed(model).unwrap();
        assert_eq!(engine.binding(1).name, "logits");
    }

    #[test]
    fn test_symbolic_dims_written_as_int64() {
        let dims = tract_ndarray::arr1(&[TDim::from(1i64), TDim::from(1000i64)])
            .into_dyn()
            .into_tensor();
        let bytes = tensor_bytes(&dims).unwrap();

        let expected: Vec<u8> = [1i64, 1000].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(bytes, expected);
        assert_eq!(engine_data_type(DatumType::TDim).unwrap(), EngineDataType::Int64);
    }

    #[test]
    fn test_profile_min_dims() {
        let engine = passthrough_engine();
        assert_eq!(engine.profile_min_dims(0, 0), Some(vec![1, 3, 2, 2]));
        assert_eq!(engine.profile_min_dims(1, 0), None);
    }

    #[test]
    fn test_set_binding_dimensions_checks_rank() {
        let engine = passthrough_engine();
        let mut context = engine.create_context().unwrap();
        assert!(!ExecutionContext::<HostDevice>::set_binding_dimensions(&mut context, 0, &[1, 3]));
        assert!(ExecutionContext::<HostDevice>::set_binding_dimensions(&mut context, 0, &[1, 3, 2, 2]));
        assert!(!ExecutionContext::<HostDevice>::set_binding_dimensions(&mut context, 9, &[1]));
    }

    #[test]
    fn test_passthrough_round_trip() {
        let device = Arc::new(HostDevice::new());
        let engine = passthrough_engine();

        let bindings: Vec<BindingInfo> = (0..engine.num_bindings()).map(|i| engine.binding(i)).collect();
        let mut context = engine.create_context().unwrap();
        let mut arena = crate::backend::engine::DeviceArena::new(Arc::clone(&device));
        for binding in &bindings {
            arena.allocate(binding.byte_size().unwrap()).unwrap();
        }

        let pixels: Vec<u8> = (0..12).flat_map(|i| (i as f32).to_ne_bytes()).collect();
        arena.get(0).unwrap().upload(&pixels).unwrap();

        assert!(context.enqueue(device.as_ref(), &arena.ptrs()));
        assert_eq!(arena.get(1).unwrap().download(48).unwrap(), pixels);
    }

    #[test]
    fn test_wrong_buffer_count_fails_submission() {
        let device = HostDevice::new();
        let engine = passthrough_engine();
        let mut context = engine.create_context().unwrap();
        let ptr = device.alloc(48).unwrap();

        assert!(!context.enqueue(&device, &[ptr]));
    }

    #[test]
    fn test_backend_over_tract_engine() {
        let device = Arc::new(HostDevice::new());
        let mut backend = EngineBackend::<TractEngineRuntime, HostDevice>::from_engine(
            TractEngineRuntime,
            Arc::clone(&device),
            passthrough_engine(),
            1,
            &[],
        )
        .unwrap();

        let image = ImageTensor::from_hwc(vec![0.25; 12], 2, 2, 3).unwrap();
        let output = backend.infer(&image).unwrap();

        assert_eq!(output.shapes, vec![vec![1, 3, 2, 2]]);
        assert!(output.tensors[0].iter().all(|v| *v == TensorElement::Float32(0.25)));

        drop(backend);
        assert_eq!(device.stats().live_bytes, 0);
    }
}
