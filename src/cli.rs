//! CLI interface for atecu

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{self, BusBackend, Config};
use crate::controller::{
    JsonLinesStatusSink, LogStatusSink, ReplaySource, StatusSink, SyntheticDrive, TransmissionController,
    VehicleDataSource,
};
use crate::lockup::{LockupNet, ModelArtifact};

#[derive(Parser)]
#[command(name = "atecu")]
#[command(about = "Automatic transmission controller: gear selection and learned torque-converter lockup", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "ATECU_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "atecu=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop
    Run {
        /// Use the in-memory bus instead of SocketCAN
        #[arg(long)]
        simulate: bool,
        /// Replay recorded readings (JSON lines) instead of the synthetic drive
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Shift profile to use (overrides the config file)
        #[arg(long)]
        profile: Option<String>,
        /// Write one JSON status record per cycle to stdout
        #[arg(long)]
        status_json: bool,
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Manage the lockup model artifact
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// Write a freshly initialised model and its hash sidecar
    Init {
        /// Artifact path (defaults to the configured model path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Seed for weight initialisation
        #[arg(long, default_value = "24301")]
        seed: u64,
        /// Overwrite an existing artifact
        #[arg(long)]
        force: bool,
    },
    /// Check an artifact against its recorded hash
    Verify {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration
    Validate,
}

impl Cli {
    /// Filter directive for the tracing subscriber: flag, then config file, then "info"
    pub fn log_directive(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        Config::load(self.config.as_deref())
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    }
}

/// Run the parsed command
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            simulate,
            replay,
            profile,
            status_json,
            cycles,
        } => {
            let mut config = load_config(config_path)?;
            if simulate {
                config.bus.backend = BusBackend::Simulated;
            }
            if let Some(profile) = profile {
                config.gears.profile = profile;
            }
            run_controller(config, replay.as_deref(), status_json, cycles).await?;
        }
        Commands::Model { command } => match command {
            ModelCommands::Init { path, seed, force } => {
                let path = model_path(config_path, path)?;
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                let artifact = ModelArtifact::from_net(&LockupNet::seeded(seed)).context("serializing model")?;
                artifact
                    .save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Model written to {}", path.display());
                println!("sha256 {}", artifact.recorded_hash());
            }
            ModelCommands::Verify { path } => {
                let path = model_path(config_path, path)?;
                let (artifact, net) = ModelArtifact::load_verified(&path)
                    .with_context(|| format!("verifying {}", path.display()))?;
                println!("{}: OK", path.display());
                println!("sha256 {}", artifact.recorded_hash());
                println!(
                    "{} -> {} -> 1 ({} parameters)",
                    net.input_size,
                    net.hidden_size,
                    LockupNet::parameter_count()
                );
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = load_config(config_path)?;
                print!("{}", toml::to_string_pretty(&config).context("serializing config")?);
            }
            ConfigCommands::Init { force } => {
                let path = match config_path {
                    Some(p) => p.to_path_buf(),
                    None => config::config_path()?,
                };
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                Config::default()
                    .save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Default configuration written to {}", path.display());
            }
            ConfigCommands::Validate => {
                let config = load_config(config_path)?;
                config.validate().context("configuration rejected")?;
                println!("Configuration valid");
            }
        },
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).context("loading configuration")
}

fn model_path(config_path: Option<&Path>, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(load_config(config_path)?.lockup.resolved_model_path()?),
    }
}

async fn run_controller(config: Config, replay: Option<&Path>, status_json: bool, cycles: Option<u64>) -> Result<()> {
    let source: Box<dyn VehicleDataSource> = match replay {
        Some(path) => Box::new(ReplaySource::open(path).context("loading replay")?),
        None => {
            if config.bus.backend != BusBackend::Simulated {
                warn!("driving a live bus from the synthetic drive profile");
            }
            Box::new(SyntheticDrive::new())
        }
    };
    let sink: Box<dyn StatusSink> = if status_json {
        Box::new(JsonLinesStatusSink::new(std::io::stdout()))
    } else {
        Box::new(LogStatusSink::new())
    };

    let controller =
        TransmissionController::startup(&config, source, sink).context("transmission controller failed to start")?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        flag.store(false, Ordering::SeqCst);
    });

    controller.run(running, cycles).await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
