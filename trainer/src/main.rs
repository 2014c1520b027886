mod config;
mod experiments;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::TrainConfig;

#[derive(Parser)]
#[command(name = "splitnet-trainer", about = "Train a splitting multi-task network")]
struct Cli {
    /// JSON run config; missing fields take their defaults
    #[arg(long, env = "SPLITNET_CONFIG")]
    config: Option<PathBuf>,

    /// Run name, used as the checkpoint subdirectory
    #[arg(long, env = "SPLITNET_RUN_NAME")]
    name: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Total updates, counting any restored from a checkpoint
    #[arg(long)]
    num_updates: Option<u64>,

    /// Log progress every N updates
    #[arg(long)]
    print_freq: Option<u64>,

    #[arg(long, env = "SPLITNET_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Save every N updates (0 = only at the end)
    #[arg(long)]
    checkpoint_freq: Option<u64>,

    /// Continue from <checkpoint-dir>/<name>/latest.json if present
    #[arg(long, default_value = "false")]
    resume: bool,

    /// Write the final result JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<(TrainConfig, bool, Option<PathBuf>)> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };
        if let Some(name) = self.name {
            cfg.name = name;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        if let Some(n) = self.num_updates {
            cfg.num_updates = n;
        }
        if let Some(n) = self.print_freq {
            cfg.print_freq = n;
        }
        if let Some(dir) = self.checkpoint_dir {
            cfg.checkpoint_dir = Some(dir);
        }
        if let Some(n) = self.checkpoint_freq {
            cfg.checkpoint_freq = n;
        }
        Ok((cfg, self.resume, self.output))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (cfg, resume, output) = Cli::parse().into_config()?;
    cfg.validate()?;

    let result = experiments::runner::run(&cfg, resume, |r| {
        if let Some(event) = &r.split {
            tracing::info!(
                update = r.update,
                region = event.region,
                group1 = ?event.group1,
                group2 = ?event.group2,
                params = r.num_params,
                "network split"
            );
        }
    })?;

    tracing::info!(
        updates = result.updates,
        final_loss = result.final_loss,
        splits = result.splits.len(),
        params = result.num_params,
        elapsed = %format!("{:.1}s", result.elapsed),
        "run finished"
    );

    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
