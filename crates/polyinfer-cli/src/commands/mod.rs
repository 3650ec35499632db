//! Subcommands and the helpers they share.

pub mod batch;
pub mod config;
pub mod infer;
pub mod info;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use image::imageops::FilterType;
use polyinfer_inference::{parse_input_size, BackendConfig, BackendKind, ImageTensor, LayerInfo};
use tracing::debug;

/// Backend selection flags shared by the model-running commands.
///
/// Flags override the values read from the config file.
#[derive(Args, Debug, Default)]
pub struct BackendArgs {
    /// Backend: onnxruntime, tensorflow, engine, dnn or mock
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Model file or bundle directory
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Request GPU execution (falls back to CPU)
    #[arg(long)]
    gpu: bool,

    /// Batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Input size as CxHxW, once per model input
    #[arg(long = "input-size")]
    input_sizes: Vec<String>,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("polyinfer")
        .join("config.json")
}

/// Resolve the backend configuration: explicit file, then the default file,
/// then built-in defaults, with command-line flags applied last.
pub fn load_backend_config(config_path: Option<&str>, args: &BackendArgs) -> anyhow::Result<BackendConfig> {
    let mut config = match config_path {
        Some(path) => BackendConfig::from_file(Path::new(path))
            .with_context(|| format!("Failed to read config file {}", path))?,
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                debug!("Using config file {}", default_path.display());
                BackendConfig::from_file(&default_path)?
            } else {
                BackendConfig::default()
            }
        }
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(model) = &args.model {
        config.model_path = model.clone();
    }
    if args.gpu {
        config.use_gpu = true;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if !args.input_sizes.is_empty() {
        config.input_sizes = args
            .input_sizes
            .iter()
            .map(|s| parse_input_size(s))
            .collect::<Result<_, _>>()?;
    }

    if config.backend != BackendKind::Mock && config.model_path.as_os_str().is_empty() {
        anyhow::bail!("No model given. Use --model or set model_path in the config file.");
    }

    Ok(config)
}

/// Load an image and normalize it for `input`: resized to the input's
/// spatial size when known, scaled to [0, 1], channel count matched.
pub fn load_image(path: &Path, input: Option<&LayerInfo>) -> anyhow::Result<ImageTensor> {
    let img = image::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;

    let (channels, size) = match input.map(|i| i.shape.as_slice()) {
        Some(&[c, h, w]) => (c, (h > 0 && w > 0).then_some((w as u32, h as u32))),
        _ => (3, None),
    };

    let img = match size {
        Some((w, h)) if (img.width(), img.height()) != (w, h) => {
            debug!("Resizing {}x{} to {}x{}", img.width(), img.height(), w, h);
            img.resize_exact(w, h, FilterType::Triangle)
        }
        _ => img,
    };

    Ok(if channels == 1 {
        ImageTensor::from_luma_image(&img.to_luma8())
    } else {
        ImageTensor::from_rgb_image(&img.to_rgb8())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_image_resizes_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        image::RgbImage::from_pixel(10, 20, image::Rgb([255, 0, 0])).save(&path).unwrap();

        let input = LayerInfo::new("input", vec![3, 8, 6], 1);
        let tensor = load_image(&path, Some(&input)).unwrap();

        assert_eq!(tensor.chw_shape(), [3, 8, 6]);
        assert_eq!(tensor.as_array()[[0, 0, 0]], 1.0);
        assert_eq!(tensor.as_array()[[0, 0, 1]], 0.0);
    }

    #[test]
    fn test_load_image_keeps_size_for_dynamic_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        image::GrayImage::new(5, 4).save(&path).unwrap();

        let input = LayerInfo::new("input", vec![1, -1, -1], 1);
        let tensor = load_image(&path, Some(&input)).unwrap();

        assert_eq!(tensor.chw_shape(), [1, 4, 5]);
    }

    #[test]
    fn test_flags_override_config() {
        let args = BackendArgs {
            backend: Some(BackendKind::Mock),
            batch_size: Some(4),
            input_sizes: vec!["3x32x32".to_string()],
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        BackendConfig {
            backend: BackendKind::Onnxruntime,
            model_path: "model.onnx".into(),
            ..Default::default()
        }
        .save(&path)
        .unwrap();

        let config = load_backend_config(path.to_str(), &args).unwrap();
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.model_path, PathBuf::from("model.onnx"));
        assert_eq!(config.input_sizes, vec![vec![3, 32, 32]]);
    }
}
