//! Batch command - run a model on multiple images.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use console::style;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use polyinfer_inference::{setup_inference_engine, InferenceError};
use tracing::{debug, error, warn};

use super::infer::infer_image;
use super::{load_backend_config, BackendArgs};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tiff", "webp"];

/// Arguments for the batch command.
#[derive(Args)]
pub struct BatchArgs {
    /// Input files or glob pattern
    #[arg(required = true)]
    input: String,

    #[command(flatten)]
    backend: BackendArgs,

    /// Output directory for per-image JSON reports
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Continue after errors that leave the backend usable
    #[arg(long)]
    continue_on_error: bool,
}

/// Result of processing a single file.
struct ProcessResult {
    path: PathBuf,
    error: Option<String>,
    processing_time_ms: u64,
}

pub fn run(args: BatchArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let start = Instant::now();

    // Expand glob pattern
    let files: Vec<PathBuf> = glob(&args.input)?
        .filter_map(|r| r.ok())
        .filter(|p| {
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
        })
        .collect();

    if files.is_empty() {
        anyhow::bail!("No matching files found for pattern: {}", args.input);
    }

    println!(
        "{} Found {} images to process",
        style("ℹ").blue(),
        files.len()
    );

    if let Some(ref output_dir) = args.output_dir {
        fs::create_dir_all(output_dir)?;
    }

    let config = load_backend_config(config_path, &args.backend)?;
    let mut backend = setup_inference_engine(&config)?;
    let backend_name = config.backend.to_string();

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images")?
            .progress_chars("=>-"),
    );

    // One backend instance serves every image sequentially.
    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let file_start = Instant::now();
        let result = infer_image(backend.as_mut(), &path, &backend_name);
        let processing_time_ms = file_start.elapsed().as_millis() as u64;

        match result {
            Ok(report) => {
                if let Some(output_dir) = &args.output_dir {
                    let output_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
                    let output_path = output_dir.join(format!("{}.json", output_name));
                    fs::write(&output_path, serde_json::to_string(&report)?)?;
                    debug!("Wrote output to {}", output_path.display());
                }
                results.push(ProcessResult {
                    path,
                    error: None,
                    processing_time_ms,
                });
            }
            Err(e) => {
                let fatal = e
                    .downcast_ref::<InferenceError>()
                    .is_some_and(InferenceError::is_fatal);
                if fatal || !args.continue_on_error {
                    pb.abandon();
                    error!("Failed to process {}: {}", path.display(), e);
                    return Err(e);
                }

                warn!("Failed to process {}: {}", path.display(), e);
                results.push(ProcessResult {
                    path,
                    error: Some(e.to_string()),
                    processing_time_ms,
                });
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("Complete");

    let failed: Vec<_> = results.iter().filter(|r| r.error.is_some()).collect();
    let total_ms: u64 = results.iter().map(|r| r.processing_time_ms).sum();

    println!();
    println!(
        "{} Processed {} images in {:?} ({} ms in inference and preprocessing)",
        style("✓").green(),
        results.len(),
        start.elapsed(),
        total_ms
    );

    let stats = backend.stats();
    println!(
        "{} {} inferences, last took {:.2}ms",
        style("ℹ").blue(),
        stats.total_inferences,
        stats.last_inference_ms
    );

    if !failed.is_empty() {
        println!("{} {} images failed:", style("⚠").yellow(), failed.len());
        for result in failed {
            println!(
                "  - {}: {}",
                result.path.display(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}
