//! Runtime, engine and execution-context seams of the compiled-engine backend.

use serde::{Deserialize, Serialize};

use super::device::Device;
use crate::error::{InferenceError, TypeContext};
use crate::tensor::TensorType;
use crate::Result;

/// Element type an engine declares for a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineDataType {
    Float,
    Half,
    Int8,
    Int32,
    Int64,
    Uint8,
    Bool,
}

impl EngineDataType {
    /// The tensor type this binding decodes to, if the backend supports it.
    ///
    /// Only 32-bit float and 32-bit integer bindings can be sized.
    pub fn tensor_type(self) -> Option<TensorType> {
        match self {
            EngineDataType::Float => Some(TensorType::Float32),
            EngineDataType::Int32 => Some(TensorType::Int32),
            _ => None,
        }
    }
}

/// One engine-declared input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub name: String,
    /// Declared dimensions, batch first. Dynamic dimensions are `-1`.
    pub dims: Vec<i64>,
    pub dtype: EngineDataType,
    pub is_input: bool,
}

impl BindingInfo {
    /// Number of elements the binding's buffer holds.
    pub fn volume(&self) -> usize {
        binding_volume(&self.dims)
    }

    /// Buffer size in bytes, or an engine-side unsupported-type error.
    pub fn byte_size(&self) -> Result<usize> {
        let tensor_type = self.tensor_type()?;
        Ok(self.volume() * tensor_type.byte_width())
    }

    /// The supported tensor type of this binding.
    pub fn tensor_type(&self) -> Result<TensorType> {
        self.dtype
            .tensor_type()
            .ok_or_else(|| InferenceError::UnsupportedType {
                context: TypeContext::EngineBinding,
                dtype: format!("{:?} (binding '{}')", self.dtype, self.name),
            })
    }
}

/// Product of the declared dimensions.
///
/// Dynamic (`-1`) and zero dimensions contribute a factor of 1 so that no
/// binding ends up with a zero-sized buffer.
pub fn binding_volume(dims: &[i64]) -> usize {
    dims.iter()
        .filter(|&&d| d > 0)
        .map(|&d| d as usize)
        .product()
}

/// Turns a serialized engine blob into a [`CompiledEngine`].
pub trait EngineRuntime {
    type Engine: CompiledEngine;

    /// Deserialize an engine. A partial or corrupt blob must be rejected.
    fn deserialize(&self, blob: &[u8]) -> Result<Self::Engine>;
}

/// A deserialized engine: fixed bindings plus optimization profiles.
pub trait CompiledEngine {
    type Context;

    /// Number of bindings, inputs and outputs together.
    fn num_bindings(&self) -> usize;

    /// Description of the binding at `index`, in engine-declared order.
    fn binding(&self, index: usize) -> BindingInfo;

    /// Minimum dimensions of `binding` in optimization profile `profile`.
    ///
    /// `None` when the engine was built without profiles.
    fn profile_min_dims(&self, profile: usize, binding: usize) -> Option<Vec<i64>>;

    /// Create an execution context.
    fn create_context(&self) -> Result<Self::Context>;
}

/// Executes an engine against device buffers.
pub trait ExecutionContext<D: Device> {
    /// Set the active dimensions of a dynamic binding.
    fn set_binding_dimensions(&mut self, binding: usize, dims: &[i64]) -> bool;

    /// Submit execution on the default stream, reading and writing the
    /// buffers in `bindings` (one per binding, in binding order).
    ///
    /// Returns `false` if the submission failed.
    fn enqueue(&mut self, device: &D, bindings: &[D::Ptr]) -> bool;
}
