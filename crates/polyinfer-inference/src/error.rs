//! Error types for the inference layer.

use thiserror::Error;

/// Errors that can occur while loading a model or running inference.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Failed to load the model artifact.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Failed to create an inference session or execution context.
    #[error("failed to create session: {0}")]
    SessionCreate(String),

    /// The model declares no inputs.
    #[error("model declares no inputs: {0}")]
    NoInputs(String),

    /// The image does not match the model's primary input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backend's run or submit primitive reported failure.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// The backend reported an element type outside {f32, i32, i64}.
    #[error("unsupported element type {dtype} in {context}")]
    UnsupportedType {
        context: TypeContext,
        dtype: String,
    },

    /// Output tensor extraction failed.
    #[error("failed to extract output: {0}")]
    OutputExtraction(String),

    /// Device memory allocation or transfer failed.
    #[error("device memory error: {0}")]
    DeviceMemory(String),

    /// Invalid backend configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error when loading model files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an unsupported element type was encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeContext {
    /// Decoding an output tensor returned by a session-based backend.
    OutputDecoding,
    /// Sizing a compiled-engine binding before any data exists.
    EngineBinding,
}

impl std::fmt::Display for TypeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeContext::OutputDecoding => write!(f, "output decoding"),
            TypeContext::EngineBinding => write!(f, "engine binding"),
        }
    }
}

impl InferenceError {
    /// Whether the error leaves the backend unable to serve further requests.
    ///
    /// Fatal errors must not be turned into a fallback result: the caller's
    /// top-level boundary is expected to terminate. Only unsupported output
    /// types in the session-based adapters and caller input mistakes are
    /// recoverable.
    pub fn is_fatal(&self) -> bool {
        match self {
            InferenceError::UnsupportedType { context, .. } => {
                *context == TypeContext::EngineBinding
            }
            InferenceError::InvalidInput(_)
            | InferenceError::OutputExtraction(_)
            | InferenceError::Config(_) => false,
            InferenceError::ModelLoad(_)
            | InferenceError::SessionCreate(_)
            | InferenceError::NoInputs(_)
            | InferenceError::InferenceFailed(_)
            | InferenceError::DeviceMemory(_)
            | InferenceError::Io(_) => true,
        }
    }

    pub(crate) fn unsupported_output(dtype: impl std::fmt::Debug) -> Self {
        InferenceError::UnsupportedType {
            context: TypeContext::OutputDecoding,
            dtype: format!("{:?}", dtype),
        }
    }
}
