//! Compiled-engine backend.
//!
//! Unlike the session-based backends, this one owns the accelerator memory
//! itself: one device buffer per binding, allocated when the engine is
//! loaded and released when the backend is dropped. Inference uploads the
//! inputs, submits the engine on the default stream and copies every output
//! back to the host.

mod device;
mod runtime;
#[cfg(feature = "tract")]
mod tract_runtime;

pub use device::{Device, DeviceArena, DeviceBuffer, HostDevice, HostDeviceStats, HostPtr};
pub use runtime::{
    binding_volume, BindingInfo, CompiledEngine, EngineDataType, EngineRuntime, ExecutionContext,
};
#[cfg(feature = "tract")]
pub use tract_runtime::{TractEngine, TractEngineContext, TractEngineRuntime};

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{InferenceStats, InferenceTimer};
use crate::error::InferenceError;
use crate::model_info::{strip_batch, ModelInfo};
use crate::tensor::{ImageTensor, InferenceOutput, TensorElement, TensorType};
use crate::{InferenceBackend, Result};

/// Rank of every output shape this backend reports.
pub const OUTPUT_RANK: usize = 4;

type ContextOf<R> = <<R as EngineRuntime>::Engine as CompiledEngine>::Context;

/// Backend executing a serialized, pre-compiled engine.
pub struct EngineBackend<R, D>
where
    R: EngineRuntime,
    D: Device,
{
    // Field order is drop order: the context goes before the buffers it
    // references, the buffers before the engine, the engine before its runtime.
    context: ContextOf<R>,
    buffers: DeviceArena<D>,
    engine: R::Engine,
    _runtime: R,
    bindings: Vec<BindingInfo>,
    input_bindings: Vec<usize>,
    output_bindings: Vec<usize>,
    model_info: ModelInfo,
    timer: InferenceTimer,
}

impl<R, D> EngineBackend<R, D>
where
    R: EngineRuntime,
    D: Device,
    ContextOf<R>: ExecutionContext<D>,
{
    /// Read a serialized engine from disk and prepare it for inference.
    pub fn from_file<P: AsRef<Path>>(
        runtime: R,
        device: Arc<D>,
        path: P,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing compiled engine from: {}", path.display());

        let blob = std::fs::read(path).map_err(|e| {
            InferenceError::ModelLoad(format!("Failed to open engine file {}: {}", path.display(), e))
        })?;

        Self::from_blob(runtime, device, &blob, batch_size, input_sizes)
    }

    /// Deserialize an in-memory engine blob and prepare it for inference.
    pub fn from_blob(
        runtime: R,
        device: Arc<D>,
        blob: &[u8],
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        debug!("Deserializing engine of {} bytes", blob.len());
        let engine = runtime.deserialize(blob)?;
        Self::from_engine(runtime, device, engine, batch_size, input_sizes)
    }

    /// Prepare an already deserialized engine for inference.
    pub fn from_engine(
        runtime: R,
        device: Arc<D>,
        engine: R::Engine,
        batch_size: usize,
        input_sizes: &[Vec<i64>],
    ) -> Result<Self> {
        let bindings: Vec<BindingInfo> = (0..engine.num_bindings()).map(|i| engine.binding(i)).collect();
        if !bindings.iter().any(|b| b.is_input) {
            return Err(InferenceError::NoInputs("engine declares no input bindings".to_string()));
        }

        let mut context = engine.create_context()?;
        let active_dims = match engine.profile_min_dims(0, 0) {
            Some(dims) => {
                info!("Minimum profile batch for binding 0: {:?}", dims.first());
                Some(dims)
            }
            None => input_sizes.first().map(|hint| {
                let mut dims = vec![batch_size.max(1) as i64];
                dims.extend_from_slice(hint);
                dims
            }),
        };
        if let Some(dims) = active_dims {
            if !context.set_binding_dimensions(0, &dims) {
                return Err(InferenceError::SessionCreate(format!(
                    "engine rejected binding dimensions {:?}",
                    dims
                )));
            }
        }

        // Buffers allocated so far are released by the arena if a later binding fails.
        let mut buffers = DeviceArena::new(device);
        let mut input_bindings = Vec::new();
        let mut output_bindings = Vec::new();

        for (index, binding) in bindings.iter().enumerate() {
            let bytes = binding.byte_size()?;
            buffers.allocate(bytes)?;

            if binding.is_input {
                info!("Input layer {} {} ({} bytes)", input_bindings.len(), binding.name, bytes);
                input_bindings.push(index);
            } else {
                info!("Output layer {} {} ({} bytes)", output_bindings.len(), binding.name, bytes);
                output_bindings.push(index);
            }
        }

        let batch_size = batch_size.max(1);
        let mut model_info = ModelInfo::new();
        for &index in &input_bindings {
            let binding = &bindings[index];
            model_info.add_input(&binding.name, strip_batch(&binding.dims), batch_size);
        }
        for &index in &output_bindings {
            let binding = &bindings[index];
            model_info.add_output(&binding.name, strip_batch(&binding.dims), batch_size);
        }

        Ok(Self {
            context,
            buffers,
            engine,
            _runtime: runtime,
            bindings,
            input_bindings,
            output_bindings,
            model_info,
            timer: InferenceTimer::new(),
        })
    }

    /// Bindings in engine-declared order.
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.bindings
    }

    /// The deserialized engine.
    pub fn engine(&self) -> &R::Engine {
        &self.engine
    }

    /// Device bytes held across all bindings.
    pub fn device_bytes(&self) -> usize {
        self.buffers.total_bytes()
    }

    fn buffer(&self, index: usize) -> Result<&DeviceBuffer<D>> {
        self.buffers
            .get(index)
            .ok_or_else(|| InferenceError::DeviceMemory(format!("no buffer for binding {}", index)))
    }

    fn upload_inputs(&self, image: &ImageTensor) -> Result<()> {
        for (position, &index) in self.input_bindings.iter().enumerate() {
            let binding = &self.bindings[index];
            let buffer = self.buffer(index)?;

            match position {
                0 => {
                    let blob = image.to_nchw();
                    let bytes: Vec<u8> = blob.iter().flat_map(|v| v.to_ne_bytes()).collect();
                    if bytes.len() > buffer.len() {
                        return Err(InferenceError::InvalidInput(format!(
                            "image needs {} bytes but binding '{}' holds {}",
                            bytes.len(),
                            binding.name,
                            buffer.len()
                        )));
                    }
                    buffer.upload(&bytes)?;
                }
                1 => {
                    // Second input carries the target size (height, width), e.g. for RT-DETR.
                    let [height, width] = image.target_size();
                    let bytes: Vec<u8> = match binding.tensor_type()? {
                        TensorType::Int32 => [height as i32, width as i32]
                            .iter()
                            .flat_map(|v| v.to_ne_bytes())
                            .collect(),
                        TensorType::Float32 => [height as f32, width as f32]
                            .iter()
                            .flat_map(|v| v.to_ne_bytes())
                            .collect(),
                        TensorType::Int64 => [height, width].iter().flat_map(|v| v.to_ne_bytes()).collect(),
                    };
                    let len = bytes.len().min(buffer.len());
                    buffer.upload(&bytes[..len])?;
                }
                _ => debug!("Leaving input binding '{}' untouched", binding.name),
            }
        }

        Ok(())
    }

    fn download_output(&self, index: usize) -> Result<(Vec<TensorElement>, Vec<i64>)> {
        let binding = &self.bindings[index];
        let tensor_type = binding.tensor_type()?;
        let host = self
            .buffer(index)?
            .download(binding.volume() * tensor_type.byte_width())?;

        Ok((tensor_type.decode(&host), output_shape(binding)))
    }
}

impl<R, D> InferenceBackend for EngineBackend<R, D>
where
    R: EngineRuntime + Send,
    R::Engine: Send,
    ContextOf<R>: ExecutionContext<D> + Send,
    D: Device,
{
    fn infer(&mut self, image: &ImageTensor) -> Result<InferenceOutput> {
        if let Some(primary) = self.model_info.primary_input() {
            image.validate_against(primary)?;
        }

        self.timer.start();
        self.upload_inputs(image)?;

        let ptrs = self.buffers.ptrs();
        if !self.context.enqueue(self.buffers.device(), &ptrs) {
            return Err(InferenceError::InferenceFailed("engine submission failed".to_string()));
        }

        let mut results = InferenceOutput::with_capacity(self.output_bindings.len());
        for &index in &self.output_bindings {
            let (tensor, shape) = self.download_output(index)?;
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

    fn memory_usage_mb(&self) -> usize {
        self.device_bytes() / (1024 * 1024)
    }
}

/// Output shape as (batch, d1, d2, d3).
///
/// A dynamic batch is reported as 1. The rank is fixed at four whatever the
/// binding declares; missing trailing dimensions are reported as 1.
fn output_shape(binding: &BindingInfo) -> Vec<i64> {
    let dims = &binding.dims;
    if dims.len() != OUTPUT_RANK {
        warn!(
            "Output '{}' has rank {}, reporting it with rank {}",
            binding.name,
            dims.len(),
            OUTPUT_RANK
        );
    }

    let batch = match dims.first() {
        Some(&d) if d > 0 => d,
        _ => 1,
    };

    let mut shape = Vec::with_capacity(OUTPUT_RANK);
    shape.push(batch);
    shape.extend((1..OUTPUT_RANK).map(|i| dims.get(i).copied().unwrap_or(1)));
    shape
}
