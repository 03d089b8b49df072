//! `script_runner`: drive a processor module outside a host pipeline.
//!
//! Feeds a deterministic synthetic signal through a [`ScriptProcessor`] so a
//! module can be exercised, checked and hot-reloaded from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use script_bridge::config::BridgeConfig;
use script_bridge::controller::{CycleOutcome, LifecycleController};
use script_bridge::loader::{ModuleLoader, RhaiLoader};
use script_bridge::processor::{DataStream, PlanarBuffer, ScriptProcessor};
use script_bridge::script::{ScriptLanguage, ScriptReference};
use script_bridge::status::ModuleState;
use script_bridge::template::ProcessorTemplate;
use std::collections::HashMap;
use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run and inspect scripted processor modules
#[derive(Parser, Debug)]
#[command(name = "script_runner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and inspect scripted processor modules", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a synthetic signal through a module
    Run {
        /// Module to load (defaults to `script_path` from the configuration)
        #[arg(value_name = "SCRIPT")]
        script: Option<PathBuf>,

        /// Number of channels in the synthetic stream
        #[arg(long, default_value_t = 4)]
        channels: usize,

        /// Sample rate in Hz
        #[arg(long, default_value_t = 30000.0)]
        sample_rate: f32,

        /// Samples per block
        #[arg(long, default_value_t = 1024)]
        block_size: usize,

        /// Number of blocks to process
        #[arg(long, default_value_t = 100)]
        blocks: usize,

        /// Reload the module whenever the file changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Import and instantiate a module, then exit
    Check {
        /// Module to check (defaults to `script_path` from the configuration)
        #[arg(value_name = "SCRIPT")]
        script: Option<PathBuf>,

        /// Channel count passed to the constructor
        #[arg(long, default_value_t = 1)]
        channels: usize,

        /// Sample rate passed to the constructor
        #[arg(long, default_value_t = 30000.0)]
        sample_rate: f32,
    },

    /// Write a starter module (language from the extension)
    Template {
        /// Destination file (.rhai or .py)
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Processor class name (defaults to the configured class)
        #[arg(long)]
        class: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone)]
struct RunOptions {
    script: PathBuf,
    channels: usize,
    sample_rate: f32,
    block_size: usize,
    blocks: usize,
    watch: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BridgeConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => BridgeConfig::load().context("Failed to load configuration")?,
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Run {
            script,
            channels,
            sample_rate,
            block_size,
            blocks,
            watch,
        } => {
            let options = RunOptions {
                script: script_or_configured(script, &config)?,
                channels,
                sample_rate,
                block_size,
                blocks,
                watch,
            };
            match language_of(&options.script)? {
                ScriptLanguage::Rhai => run(rhai_loader(&config), &options, &config),
                ScriptLanguage::Python => run(python_loader(&config)?, &options, &config),
            }
        }
        Commands::Check {
            script,
            channels,
            sample_rate,
        } => {
            let script = script_or_configured(script, &config)?;
            match language_of(&script)? {
                ScriptLanguage::Rhai => check(rhai_loader(&config), &script, channels, sample_rate),
                ScriptLanguage::Python => {
                    check(python_loader(&config)?, &script, channels, sample_rate)
                }
            }
        }
        Commands::Template { path, class } => {
            let class = class.unwrap_or_else(|| config.processor_class.clone());
            ProcessorTemplate::for_path(&path, class)?.write_to(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn script_or_configured(script: Option<PathBuf>, config: &BridgeConfig) -> Result<PathBuf> {
    match script.or_else(|| config.script_path.clone()) {
        Some(path) => Ok(path),
        None => bail!("No script given and no script_path configured"),
    }
}

fn language_of(script: &Path) -> Result<ScriptLanguage> {
    let language = ScriptReference::new(script)?.language();
    if !language.is_available() {
        bail!(script_bridge::BridgeError::FeatureNotEnabled(
            "scripting_python".to_string()
        ));
    }
    Ok(language)
}

fn rhai_loader(config: &BridgeConfig) -> RhaiLoader {
    RhaiLoader::new(&config.rhai, config.processor_class.as_str())
}

#[cfg(feature = "scripting_python")]
fn python_loader(config: &BridgeConfig) -> Result<script_bridge::loader::PythonLoader> {
    Ok(script_bridge::loader::PythonLoader::new(
        config.processor_class.as_str(),
    ))
}

#[cfg(not(feature = "scripting_python"))]
fn python_loader(_config: &BridgeConfig) -> Result<RhaiLoader> {
    bail!(script_bridge::BridgeError::FeatureNotEnabled(
        "scripting_python".to_string()
    ))
}

fn check<L: ModuleLoader>(
    loader: L,
    script: &Path,
    channels: usize,
    sample_rate: f32,
) -> Result<()> {
    let mut controller = LifecycleController::new(loader);
    controller.apply_configuration(channels, sample_rate);
    controller.set_script_path(script);
    controller.import_and_activate()?;
    println!(
        "{}: {} constructed ({} channels @ {} Hz)",
        controller.status().label,
        controller.loader().processor_class(),
        channels,
        sample_rate
    );
    Ok(())
}

/// Deterministic test signal: channel `c` is a sine at `10 * (c + 1)` Hz.
fn fill_block(buffer: &mut PlanarBuffer, first_sample: usize, sample_rate: f32) {
    let rate = if sample_rate > 0.0 { sample_rate } else { 1.0 };
    for c in 0..buffer.num_channels() {
        let freq = 10.0 * (c + 1) as f32;
        if let Some(channel) = buffer.channel_mut(c) {
            for (i, sample) in channel.iter_mut().enumerate() {
                let t = (first_sample + i) as f32 / rate;
                *sample = (TAU * freq * t).sin();
            }
        }
    }
}

fn run<L: ModuleLoader>(loader: L, options: &RunOptions, config: &BridgeConfig) -> Result<()> {
    info!(
        "Running {} blocks of {}x{} samples through {}",
        options.blocks,
        options.channels,
        options.block_size,
        options.script.display()
    );
    let mut stage = ScriptProcessor::new(LifecycleController::new(loader), &config.streams);
    stage.update_settings([DataStream::new(
        0,
        "synthetic",
        options.channels,
        options.sample_rate,
    )]);

    if stage.load_script(&options.script) != ModuleState::Ready {
        warn!(
            "Module not ready: {}",
            stage.controller().diagnostic().unwrap_or("unknown error")
        );
    }

    #[cfg(feature = "hot_reload")]
    let watcher = if options.watch {
        Some(script_bridge::watch::ScriptWatcher::new(&options.script)?)
    } else {
        None
    };
    #[cfg(not(feature = "hot_reload"))]
    if options.watch {
        warn!("--watch requires the hot_reload feature; ignoring");
    }

    let mut buffer = PlanarBuffer::new(options.channels, options.block_size);
    let counts = HashMap::from([(0u16, options.block_size)]);
    let mut sum_squares = vec![0.0f64; options.channels];
    let mut processed_blocks = 0usize;
    let mut faults = 0usize;

    stage.start_acquisition();
    for block in 0..options.blocks {
        #[cfg(feature = "hot_reload")]
        if watcher.as_ref().is_some_and(|w| w.take_change()) {
            info!("Script changed, reloading");
            if let Err(err) = stage.reload() {
                warn!("Reload failed: {}", err);
            }
        }

        fill_block(&mut buffer, block * options.block_size, options.sample_rate);
        match stage.process(&mut buffer, &counts) {
            CycleOutcome::Completed { .. } => {
                processed_blocks += 1;
                for (c, channel) in buffer.channels().iter().enumerate() {
                    sum_squares[c] += channel.iter().map(|&s| f64::from(s).powi(2)).sum::<f64>();
                }
            }
            CycleOutcome::Faulted { stream_id } => {
                faults += 1;
                warn!("Block {} faulted on stream {}", block, stream_id);
            }
            CycleOutcome::Skipped => {}
        }
    }
    stage.stop_acquisition();

    let status = stage.controller().status();
    println!("Module:    {}", status.label);
    println!("State:     {}", status.state);
    println!(
        "Processed: {}/{} blocks ({} faults)",
        processed_blocks, options.blocks, faults
    );
    if processed_blocks > 0 {
        let samples = (processed_blocks * options.block_size) as f64;
        for (c, total) in sum_squares.iter().enumerate() {
            println!("  ch{:<3} rms {:.6}", c, (total / samples).sqrt());
        }
    }

    if status.state == ModuleState::Faulted {
        bail!(
            "module faulted: {}",
            status.diagnostic.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}
