//! Infer command - run a model on a single image.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;
use console::style;
use polyinfer_inference::{
    setup_inference_engine, InferenceBackend, InferenceOutput, InferenceStats, TensorElement, TensorType,
};
use serde::Serialize;
use tracing::{debug, info};

use super::{load_backend_config, load_image, BackendArgs};

/// Arguments for the infer command.
#[derive(Args)]
pub struct InferArgs {
    /// Input image
    #[arg(required = true)]
    input: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Number of highest values listed per output in text format
    #[arg(long, default_value = "5")]
    top_k: usize,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output with every tensor value
    Json,
    /// Plain text summary
    Text,
}

/// One output tensor in a report.
#[derive(Debug, Serialize)]
pub struct OutputReport {
    pub name: String,
    pub shape: Vec<i64>,
    pub dtype: Option<TensorType>,
    pub values: Vec<TensorElement>,
}

/// Result of running one image.
#[derive(Debug, Serialize)]
pub struct InferenceReport {
    pub image: PathBuf,
    pub backend: String,
    pub outputs: Vec<OutputReport>,
    pub stats: InferenceStats,
}

pub fn run(args: InferArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let start = Instant::now();

    if !args.input.exists() {
        anyhow::bail!("Input file not found: {}", args.input.display());
    }

    let config = load_backend_config(config_path, &args.backend)?;
    let mut backend = setup_inference_engine(&config)?;

    info!("Processing image: {}", args.input.display());
    let report = infer_image(backend.as_mut(), &args.input, &config.backend.to_string())?;

    let output = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Text => format_report(&report, args.top_k),
    };

    if let Some(output_path) = &args.output {
        fs::write(output_path, &output)?;
        println!(
            "{} Output written to {}",
            style("✓").green(),
            output_path.display()
        );
    } else {
        println!("{}", output);
    }

    debug!("Total processing time: {:?}", start.elapsed());

    Ok(())
}

/// Load, normalize and run one image.
pub fn infer_image(
    backend: &mut dyn InferenceBackend,
    path: &Path,
    backend_name: &str,
) -> anyhow::Result<InferenceReport> {
    let image = load_image(path, backend.model_info().primary_input())?;
    let output = backend.infer(&image)?;

    Ok(InferenceReport {
        image: path.to_path_buf(),
        backend: backend_name.to_string(),
        outputs: output_reports(backend, output),
        stats: backend.stats(),
    })
}

fn output_reports(backend: &dyn InferenceBackend, output: InferenceOutput) -> Vec<OutputReport> {
    let layers = backend.model_info().outputs();
    let (tensors, shapes) = output.into_parts();

    tensors
        .into_iter()
        .zip(shapes)
        .enumerate()
        .map(|(idx, (values, shape))| OutputReport {
            name: layers
                .get(idx)
                .map(|l| l.name.clone())
                .unwrap_or_else(|| format!("output{}", idx)),
            shape,
            dtype: values.first().map(TensorElement::dtype),
            values,
        })
        .collect()
}

fn format_report(report: &InferenceReport, top_k: usize) -> String {
    let mut lines = vec![
        format!("Image: {}", report.image.display()),
        format!("Backend: {}", report.backend),
        format!("Time: {:.2}ms", report.stats.last_inference_ms),
    ];

    for output in &report.outputs {
        lines.push(String::new());
        lines.push(format!(
            "{} {:?} {} values",
            output.name,
            output.shape,
            output.values.len()
        ));

        for (index, value) in top_values(&output.values, top_k) {
            lines.push(format!("  [{}] {}", index, value));
        }
    }

    lines.join("\n")
}

/// Indices and values of the `k` largest elements, largest first.
fn top_values(values: &[TensorElement], k: usize) -> Vec<(usize, f64)> {
    let mut indexed: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let value = match *v {
                TensorElement::Float32(x) => x as f64,
                TensorElement::Int32(x) => x as f64,
                TensorElement::Int64(x) => x as f64,
            };
            (i, value)
        })
        .collect();

    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_values_orders_descending() {
        let values = vec![
            TensorElement::Float32(0.1),
            TensorElement::Float32(0.7),
            TensorElement::Float32(0.2),
        ];

        let top = top_values(&values, 2);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_top_values_mixed_integer_types() {
        let values = vec![TensorElement::Int64(3), TensorElement::Int32(-1)];
        assert_eq!(top_values(&values, 5), vec![(0, 3.0), (1, -1.0)]);
    }
}
