//! CLI application for running models through the polyinfer backends.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use polyinfer_inference::InferenceError;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use commands::{batch, config, infer, info};

/// Run inference on images with ONNX Runtime, tract or compiled engines
#[derive(Parser)]
#[command(name = "polyinfer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the inputs and outputs of a model
    Info(info::InfoArgs),

    /// Run inference on a single image
    Infer(infer::InferArgs),

    /// Run inference on multiple images
    Batch(batch::BatchArgs),

    /// Manage configuration
    Config(config::ConfigArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let result = match cli.command {
        Commands::Info(args) => info::run(args, cli.config.as_deref()),
        Commands::Infer(args) => infer::run(args, cli.config.as_deref()),
        Commands::Batch(args) => batch::run(args, cli.config.as_deref()),
        Commands::Config(args) => config::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Fatal backend errors end the process; nothing is retried.
            let fatal = e
                .downcast_ref::<InferenceError>()
                .is_some_and(InferenceError::is_fatal);
            if fatal {
                error!("Fatal inference error: {}", e);
                eprintln!("{} fatal: {:#}", style("✗").red(), e);
            } else {
                eprintln!("{} {:#}", style("✗").red(), e);
            }
            ExitCode::FAILURE
        }
    }
}
