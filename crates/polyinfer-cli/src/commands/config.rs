//! Config command - manage configuration.

use std::fs;
use std::path::PathBuf;

use clap::{Args, Subcommand};
use console::style;
use polyinfer_inference::BackendConfig;

use super::default_config_path;

/// Arguments for the config command.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show current configuration
    Show,

    /// Initialize a new configuration file
    Init(InitArgs),

    /// Get a configuration value
    Get {
        /// Configuration key (e.g., "batch_size")
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// New value (JSON, or a plain string)
        value: String,
    },

    /// Show configuration file path
    Path,
}

#[derive(Args)]
struct InitArgs {
    /// Output path for configuration file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => show_config(),
        ConfigCommand::Init(init_args) => init_config(init_args),
        ConfigCommand::Get { key } => get_config(&key),
        ConfigCommand::Set { key, value } => set_config(&key, &value),
        ConfigCommand::Path => show_path(),
    }
}

fn load_or_default() -> anyhow::Result<BackendConfig> {
    let config_path = default_config_path();
    if config_path.exists() {
        Ok(BackendConfig::from_file(&config_path)?)
    } else {
        Ok(BackendConfig::default())
    }
}

fn show_config() -> anyhow::Result<()> {
    if !default_config_path().exists() {
        println!(
            "{} No config file found, showing defaults.",
            style("ℹ").blue()
        );
    }

    let config = load_or_default()?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}

fn init_config(args: InitArgs) -> anyhow::Result<()> {
    let output_path = args.output.unwrap_or_else(default_config_path);

    if output_path.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            output_path.display()
        );
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    BackendConfig::default().save(&output_path)?;

    println!(
        "{} Created configuration file at {}",
        style("✓").green(),
        output_path.display()
    );

    Ok(())
}

fn get_config(key: &str) -> anyhow::Result<()> {
    let json = serde_json::to_value(load_or_default()?)?;

    let value = json
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("Configuration key not found: {}", key))?;

    println!("{}", serde_json::to_string_pretty(value)?);

    Ok(())
}

fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let config_path = default_config_path();
    let config = load_or_default()?;

    let parsed_value: serde_json::Value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));

    let mut json = serde_json::to_value(&config)?;
    let fields = json
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("Configuration is not an object"))?;
    if !fields.contains_key(key) {
        anyhow::bail!("Configuration key not found: {}", key);
    }
    fields.insert(key.to_string(), parsed_value.clone());

    // Round-trip through the typed config so invalid values are rejected.
    let config: BackendConfig = serde_json::from_value(json)?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    config.save(&config_path)?;

    println!(
        "{} Set {} = {}",
        style("✓").green(),
        key,
        serde_json::to_string(&parsed_value)?
    );

    Ok(())
}

fn show_path() -> anyhow::Result<()> {
    let config_path = default_config_path();

    println!("Configuration file: {}", config_path.display());

    if config_path.exists() {
        println!("Status: {}", style("exists").green());
    } else {
        println!("Status: {}", style("not created").yellow());
        println!();
        println!("Run 'polyinfer config init' to create a configuration file.");
    }

    Ok(())
}
