//! Backend construction from configuration.

use tracing::info;

use crate::backend::mock::MockBackend;
use crate::config::{BackendConfig, BackendKind};
#[cfg(any(not(feature = "onnxruntime"), not(feature = "tract")))]
use crate::error::InferenceError;
use crate::{InferenceBackend, Result};

/// Construct the backend selected by `config`.
///
/// The choice is made once; the returned backend never switches runtime.
pub fn setup_inference_engine(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    info!(
        "Setting up {} backend for {}",
        config.backend,
        config.model_path.display()
    );

    match config.backend {
        BackendKind::Mock => Ok(Box::new(MockBackend::new())),
        BackendKind::Onnxruntime => onnxruntime(config),
        BackendKind::Tensorflow => tensorflow(config),
        BackendKind::Engine => engine(config),
        BackendKind::Dnn => dnn(config),
    }
}

#[cfg(feature = "onnxruntime")]
fn onnxruntime(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    let backend = crate::OrtBackend::from_file(
        &config.model_path,
        config.use_gpu,
        config.batch_size,
        &config.input_sizes,
    )?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "onnxruntime"))]
fn onnxruntime(_config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    Err(disabled(BackendKind::Onnxruntime, "onnxruntime"))
}

#[cfg(feature = "tract")]
fn tensorflow(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    let backend = crate::TensorflowBackend::from_path(
        &config.model_path,
        config.use_gpu,
        config.batch_size,
        &config.input_sizes,
    )?;
    Ok(Box::new(backend))
}

#[cfg(feature = "tract")]
fn dnn(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    let backend = crate::DnnBackend::from_file(
        &config.model_path,
        config.use_gpu,
        config.batch_size,
        &config.input_sizes,
    )?;
    Ok(Box::new(backend))
}

#[cfg(feature = "tract")]
fn engine(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    use std::sync::Arc;

    use crate::backend::engine::{EngineBackend, HostDevice, TractEngineRuntime};
    use crate::backend::select_accelerator;

    // Device memory is host memory for this runtime.
    select_accelerator(config.use_gpu, &["CPU"]);

    let backend = EngineBackend::<TractEngineRuntime, HostDevice>::from_file(
        TractEngineRuntime,
        Arc::new(HostDevice::new()),
        &config.model_path,
        config.batch_size,
        &config.input_sizes,
    )?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "tract"))]
fn tensorflow(_config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    Err(disabled(BackendKind::Tensorflow, "tract"))
}

#[cfg(not(feature = "tract"))]
fn dnn(_config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    Err(disabled(BackendKind::Dnn, "tract"))
}

#[cfg(not(feature = "tract"))]
fn engine(_config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
    Err(disabled(BackendKind::Engine, "tract"))
}

#[cfg(any(not(feature = "onnxruntime"), not(feature = "tract")))]
fn disabled(kind: BackendKind, feature: &str) -> InferenceError {
    InferenceError::Config(format!(
        "the {} backend requires the '{}' feature",
        kind, feature
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::ImageTensor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mock_backend_from_config() {
        let config = BackendConfig {
            backend: BackendKind::Mock,
            ..Default::default()
        };
        let mut backend = setup_inference_engine(&config).unwrap();

        assert_eq!(backend.model_info().inputs()[0].shape, vec![3, 224, 224]);
        let output = backend.infer(&ImageTensor::zeros(224, 224, 3)).unwrap();
        assert_eq!(output.shapes, vec![vec![1, 1000]]);
    }

    #[test]
    fn test_missing_engine_file_is_fatal() {
        let config = BackendConfig {
            backend: BackendKind::Engine,
            model_path: "/nonexistent/model.engine".into(),
            ..Default::default()
        };
        let err = setup_inference_engine(&config).err().unwrap();

        #[cfg(feature = "tract")]
        assert!(matches!(err, InferenceError::ModelLoad(_)) && err.is_fatal());
        #[cfg(not(feature = "tract"))]
        assert!(matches!(err, InferenceError::Config(_)));
    }

    #[test]
    fn test_dnn_without_sizes_is_config_error() {
        let config = BackendConfig {
            backend: BackendKind::Dnn,
            model_path: "net.onnx".into(),
            ..Default::default()
        };
        let err = setup_inference_engine(&config).err().unwrap();
        assert!(matches!(err, InferenceError::Config(_)));
    }
}
