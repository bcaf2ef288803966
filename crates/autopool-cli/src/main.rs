//! autopool: inspect local load and exercise the autoscaled pool.
//!
//! # Usage
//!
//! ```text
//! autopool status --secs 10
//! autopool simulate --tasks 200 --task-millis 250 --config autopool.toml
//! autopool config --config autopool.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use autopool_core::AutopoolConfig;
use autopool_pool::AutoscaledPool;
use autopool_snapshot::Snapshotter;
use autopool_status::SystemStatus;

#[derive(Parser)]
#[command(name = "autopool", about = "Adaptive concurrency pool tools")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample this host for a while and print its load status as JSON.
    Status {
        /// Seconds to sample before reporting.
        #[arg(long, default_value = "5")]
        secs: u64,

        /// Path to an autopool.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run synthetic sleeping tasks through an autoscaled pool.
    Simulate {
        /// Number of tasks to run.
        #[arg(long, default_value = "100")]
        tasks: usize,

        /// Duration of each task in milliseconds.
        #[arg(long, default_value = "500")]
        task_millis: u64,

        /// Path to an autopool.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        /// Path to an autopool.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Status { secs, config } => {
            run_status(load_config(config.as_deref())?, Duration::from_secs(secs)).await
        }
        Command::Simulate {
            tasks,
            task_millis,
            config,
        } => {
            run_simulation(
                load_config(config.as_deref())?,
                tasks,
                Duration::from_millis(task_millis),
            )
            .await
        }
        Command::Config { config } => {
            print!("{}", load_config(config.as_deref())?.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,autopool=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AutopoolConfig> {
    match path {
        Some(path) => {
            let config = AutopoolConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(AutopoolConfig::default()),
    }
}

async fn run_status(config: AutopoolConfig, sample_for: Duration) -> anyhow::Result<()> {
    let snapshotter = Arc::new(Snapshotter::new(config.snapshotter.clone()));
    let status = SystemStatus::new(snapshotter.clone(), config.status.clone());

    snapshotter.start();
    info!(secs = sample_for.as_secs(), "sampling system load");
    tokio::time::sleep(sample_for).await;
    snapshotter.stop();

    let report = json!({
        "current": status.current_status(),
        "historical": status.historical_status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_simulation(config: AutopoolConfig, tasks: usize, task_time: Duration) -> anyhow::Result<()> {
    let remaining = Arc::new(AtomicUsize::new(tasks));
    let completed = Arc::new(AtomicUsize::new(0));

    let done = completed.clone();
    let runner = move || {
        let done = done.clone();
        async move {
            tokio::time::sleep(task_time).await;
            done.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    };
    let left = remaining.clone();
    let readiness = move || {
        let left = left.clone();
        async move {
            anyhow::Ok(
                left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok(),
            )
        }
    };
    let done = completed.clone();
    let finish = move || {
        let done = done.clone();
        async move { anyhow::Ok(done.load(Ordering::SeqCst) == tasks) }
    };

    let pool = AutoscaledPool::from_config(&config, runner, readiness, finish)?;
    let started = tokio::time::Instant::now();

    let outcome = tokio::select! {
        outcome = pool.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, aborting pool");
            pool.abort().await;
            Ok(())
        }
    };

    let report = json!({
        "tasks": tasks,
        "completed": completed.load(Ordering::SeqCst),
        "elapsed_secs": started.elapsed().as_secs_f64(),
        "final_desired_concurrency": pool.desired_concurrency(),
        "phase": format!("{:?}", pool.phase()),
        "historical": pool.system_status().historical_status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    outcome.map_err(Into::into)
}
