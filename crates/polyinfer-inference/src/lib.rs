//! Unified inference layer for polyinfer.
//!
//! One [`InferenceBackend`] contract over several runtimes:
//! - `ort` (ONNX Runtime) as the cross-framework runtime
//! - `tract` for TensorFlow graphs and plain forward-only networks
//! - a compiled-engine backend managing device memory itself
//!
//! Callers hand in a normalized [`ImageTensor`] and get back an
//! [`InferenceOutput`] of tagged tensors and shapes, whichever backend ran.

mod backend;
mod config;
mod error;
mod model_info;
mod setup;
mod tensor;

pub use backend::engine;
pub use backend::mock::{MockBackend, MOCK_CLASSES};
pub use backend::{select_accelerator, Accelerator, InferenceBackend, InferenceStats, InferenceTimer};
pub use config::{parse_input_size, BackendConfig, BackendKind};
pub use error::{InferenceError, TypeContext};
pub use model_info::{nhwc_to_chw, strip_batch, LayerInfo, ModelInfo};
pub use setup::setup_inference_engine;
pub use tensor::{tag_elements, ImageTensor, InferenceOutput, TensorElement, TensorType};

pub use backend::engine::{EngineBackend, HostDevice};

#[cfg(feature = "onnxruntime")]
pub use backend::ort::OrtBackend;

#[cfg(feature = "tract")]
pub use backend::dnn::DnnBackend;

#[cfg(feature = "tract")]
pub use backend::tensorflow::TensorflowBackend;

/// Result type for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;
