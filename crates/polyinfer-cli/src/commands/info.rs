//! Info command - show model inputs and outputs.

use clap::Args;
use console::style;
use polyinfer_inference::{setup_inference_engine, LayerInfo};

use super::{load_backend_config, BackendArgs};

/// Arguments for the info command.
#[derive(Args)]
pub struct InfoArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Print metadata as JSON
    #[arg(long)]
    json: bool,
}

pub fn run(args: InfoArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_backend_config(config_path, &args.backend)?;
    let backend = setup_inference_engine(&config)?;
    let model_info = backend.model_info();

    if args.json {
        println!("{}", serde_json::to_string_pretty(model_info)?);
        return Ok(());
    }

    println!(
        "{} {} backend, model {}",
        style("ℹ").blue(),
        config.backend,
        config.model_path.display()
    );

    println!();
    println!("{}", style("Inputs:").bold());
    for layer in model_info.inputs() {
        print_layer(layer);
    }

    println!();
    println!("{}", style("Outputs:").bold());
    for layer in model_info.outputs() {
        print_layer(layer);
    }

    let memory = backend.memory_usage_mb();
    if memory > 0 {
        println!();
        println!("{} Device memory: {} MiB", style("ℹ").blue(), memory);
    }

    Ok(())
}

fn print_layer(layer: &LayerInfo) {
    let dims: Vec<String> = layer
        .shape
        .iter()
        .map(|d| if *d < 0 { "?".to_string() } else { d.to_string() })
        .collect();
    println!(
        "  {:<24} {:<20} batch {}",
        layer.name,
        format!("({})", dims.join(", ")),
        layer.batch_size
    );
}
