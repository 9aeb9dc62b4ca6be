//! CLI Entry Point for the ViperBox control core
//!
//! Provides a command-line interface for:
//! - Validating settings documents before an experiment
//! - Checking single parameter values
//! - Running experiment scripts against the simulated box
//! - Printing the effective configuration and the built-in default documents
//!
//! # Usage
//!
//! Validate a settings document:
//! ```bash
//! viperbox validate settings/stimulation.xml
//! ```
//!
//! Run a script, streaming to an acquisition client on the configured port:
//! ```bash
//! viperbox run experiments/protocol.xml --listen
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use viperbox_control::config::AppConfig;
use viperbox_control::document::{
    default_recording_document, default_stimulation_document, render_document,
};
use viperbox_control::hardware::mock::MockViperBox;
use viperbox_control::logging::{self, OutputFormat};
use viperbox_control::ViperController;

#[derive(Parser)]
#[command(name = "viperbox")]
#[command(about = "Control core for ViperBox recording and stimulation", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format, overriding `application.log_format`
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a settings document against a fully populated box
    Validate {
        /// Path to the settings XML
        document: PathBuf,
    },

    /// Check one parameter value, e.g. `check-param amplitude1 5`
    CheckParam { name: String, value: String },

    /// Run an experiment script on the simulated box
    Run {
        /// Path to the script XML
        script: PathBuf,

        /// Run without any device calls
        #[arg(long)]
        boxless: bool,

        /// Wait for an acquisition client before starting
        #[arg(long)]
        listen: bool,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Print the built-in default settings documents
    Defaults,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Validate { document } => validate(config, document),
        Commands::CheckParam { name, value } => {
            let controller = ViperController::new(Arc::new(MockViperBox::new()), config);
            report(controller.verify_parameter(&name, &value))
        }
        Commands::Run {
            script,
            boxless,
            listen,
        } => run_script(config, script, boxless, listen),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Defaults => {
            println!("{}", render_document(&default_recording_document())?);
            println!("{}", render_document(&default_stimulation_document())?);
            Ok(())
        }
    }
}

fn report(result: viperbox_control::AppResult<String>) -> Result<()> {
    match result {
        Ok(message) => {
            println!("✅ {message}");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {e}");
            Err(e.into())
        }
    }
}

fn validate(config: AppConfig, document: PathBuf) -> Result<()> {
    let xml = std::fs::read_to_string(&document)
        .with_context(|| format!("reading {}", document.display()))?;
    let controller = ViperController::new(Arc::new(MockViperBox::new()), config);
    controller.connect("-", true, false)?;
    let result = controller.verify_document(&xml);
    controller.shutdown()?;
    report(result)
}

fn run_script(config: AppConfig, script: PathBuf, boxless: bool, listen: bool) -> Result<()> {
    let device = config.device.clone();
    let boxless = boxless || device.boxless;
    let controller = Arc::new(ViperController::new(
        Arc::new(MockViperBox::new()),
        config,
    ));
    info!(script = %script.display(), boxless, probes = %device.probes, "Running script");

    controller.connect(&device.probes, device.emulation, boxless)?;
    if listen {
        println!("{}", controller.listen_for_consumer()?);
    }

    println!("{}", controller.run_script(&script)?);
    let report = controller.wait_script()?;
    controller.shutdown()?;

    println!(
        "Executed {} entries, {} failed{}",
        report.executed,
        report.failures.len(),
        if report.aborted { " (aborted)" } else { "" }
    );
    for (index, message) in &report.failures {
        error!(entry = index, "{message}");
        eprintln!("❌ entry {index}: {message}");
    }
    if report.succeeded() {
        Ok(())
    } else {
        anyhow::bail!("script finished with failures")
    }
}
