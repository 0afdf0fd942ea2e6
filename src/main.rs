use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use compressor_tuner::{Config, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "compressor-tuner")]
#[command(about = "Train a chunk classifier that picks the best compressor per chunk")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON Lines trace store
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Directory with one raw f32 file per chunk
    #[arg(long)]
    chunks: Option<PathBuf>,

    /// Where labels, reports and models are written
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Metric that decides the winner per chunk
    #[arg(long)]
    metric: Option<String>,

    /// Ignore trace rows at or below this size
    #[arg(long)]
    min_size: Option<u64>,

    #[arg(long)]
    num_trials: Option<usize>,

    #[arg(long)]
    max_epochs: Option<u32>,

    /// Run every known metric
    #[arg(long, default_value_t = false)]
    all_metrics: bool,

    /// Export label files without training
    #[arg(long, default_value_t = false)]
    labels_only: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(trace) = &self.trace {
            config.paths.trace = trace.clone();
        }
        if let Some(chunks) = &self.chunks {
            config.paths.chunks = chunks.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.paths.output_dir = output_dir.clone();
        }
        if let Some(metric) = &self.metric {
            config.metric_name = metric.clone();
        }
        if let Some(min_size) = self.min_size {
            config.min_size = min_size;
        }
        if let Some(num_trials) = self.num_trials {
            config.num_trials = num_trials;
        }
        if let Some(max_epochs) = self.max_epochs {
            config.max_epochs = max_epochs;
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let options = RunOptions {
        all_metrics: args.all_metrics,
        labels_only: args.labels_only,
    };

    let reports = match compressor_tuner::run(&config, options) {
        Ok(reports) => reports,
        Err(e) => {
            error!("Run failed ({}): {}", e.kind(), e);
            return Err(e).context("Tuning run failed");
        }
    };

    for report in &reports {
        match &report.search {
            Some(search) => info!(
                "{}: best trial {} with loss {:.6}, accuracy {:.4} ({})",
                report.metric,
                search.best.trial_id,
                search.best.validation_loss,
                search.best.validation_accuracy,
                search.best.config
            ),
            None => info!(
                "{}: {} winning chunks, labels written to {}",
                report.metric,
                report.winners,
                report.label_path.display()
            ),
        }
    }

    info!("Done.");
    Ok(())
}
