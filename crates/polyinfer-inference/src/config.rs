//! Backend configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// Which adapter runs the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Cross-framework runtime (ONNX Runtime).
    #[default]
    Onnxruntime,
    /// Graph execution of TensorFlow graphs.
    Tensorflow,
    /// Serialized compiled engine.
    Engine,
    /// Forward-only network executor.
    Dnn,
    /// No runtime; fixed output.
    Mock,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Onnxruntime,
        BackendKind::Tensorflow,
        BackendKind::Engine,
        BackendKind::Dnn,
        BackendKind::Mock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Onnxruntime => "onnxruntime",
            BackendKind::Tensorflow => "tensorflow",
            BackendKind::Engine => "engine",
            BackendKind::Dnn => "dnn",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "onnxruntime" | "onnx" | "ort" => Ok(BackendKind::Onnxruntime),
            "tensorflow" | "tf" => Ok(BackendKind::Tensorflow),
            "engine" | "tensorrt" | "trt" => Ok(BackendKind::Engine),
            "dnn" | "opencv" => Ok(BackendKind::Dnn),
            "mock" => Ok(BackendKind::Mock),
            _ => Err(InferenceError::Config(format!(
                "unknown backend '{}' (expected one of: {})",
                s,
                BackendKind::ALL.map(BackendKind::as_str).join(", ")
            ))),
        }
    }
}

/// Everything needed to construct one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Adapter to construct.
    pub backend: BackendKind,

    /// Model file or bundle directory.
    pub model_path: PathBuf,

    /// Request accelerator execution; falls back to CPU when unavailable.
    pub use_gpu: bool,

    /// Configured batch size.
    pub batch_size: usize,

    /// Channel-first input sizes (batch excluded), one per model input.
    pub input_sizes: Vec<Vec<i64>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model_path: PathBuf::new(),
            use_gpu: false,
            batch_size: 1,
            input_sizes: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)
    }
}

/// Parse an input size written as `CxHxW` (e.g. `3x640x640`).
pub fn parse_input_size(s: &str) -> Result<Vec<i64>, InferenceError> {
    let dims = s
        .split(['x', 'X', ','])
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| InferenceError::Config(format!("invalid input size '{}': {}", s, e)))?;

    if dims.is_empty() || dims.iter().any(|&d| d <= 0) {
        return Err(InferenceError::Config(format!(
            "invalid input size '{}': dimensions must be positive",
            s
        )));
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backend_kind_round_trip_names() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("TensorRT".parse::<BackendKind>().unwrap(), BackendKind::Engine);
        assert!("caffe".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BackendKind::Tensorflow).unwrap(), "\"tensorflow\"");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BackendConfig = serde_json::from_str(r#"{"backend": "mock"}"#).unwrap();

        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.batch_size, 1);
        assert!(!config.use_gpu);
        assert!(config.input_sizes.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = BackendConfig {
            backend: BackendKind::Engine,
            model_path: PathBuf::from("models/rtdetr.engine"),
            use_gpu: true,
            batch_size: 2,
            input_sizes: vec![vec![3, 640, 640]],
        };
        config.save(&path).unwrap();

        assert_eq!(BackendConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = BackendConfig::from_file(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_parse_input_size() {
        assert_eq!(parse_input_size("3x640x640").unwrap(), vec![3, 640, 640]);
        assert_eq!(parse_input_size("3,224,224").unwrap(), vec![3, 224, 224]);
        assert!(parse_input_size("3x0x640").is_err());
        assert!(parse_input_size("axb").is_err());
    }
}
