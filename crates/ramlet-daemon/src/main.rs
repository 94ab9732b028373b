//! ramlet daemon
//!
//! Runs the dispatcher against the simulated environment.

use anyhow::Context;
use clap::Parser;
use ramlet_core::{DaemonConfig, LoggingConfig};
use ramlet_jobs::register_programs;
use ramlet_runtime::programs::register_builtin;
use ramlet_runtime::{SimRuntime, SimWorld};
use ramlet_scheduler::Dispatcher;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// ramlet daemon - memory-aware task scheduler with self-balancing jobs
#[derive(Parser, Debug)]
#[command(name = "ramletd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,

    /// Port the dispatcher reads replies from
    #[arg(long)]
    inbox_port: Option<u16>,

    /// Retries before a task is dropped
    #[arg(long)]
    max_retries: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(port) = self.inbox_port {
            config.dispatcher.inbox_port = port;
        }
        if let Some(retries) = self.max_retries {
            config.dispatcher.max_retries = retries;
        }
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {}", config.level))?;
    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false);
    let result = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish()),
        _ => tracing::subscriber::set_global_default(builder.finish()),
    };
    result.context("failed to set subscriber")
}

/// Simulated world and runtime with every program registered
fn build_environment(config: &DaemonConfig) -> (Arc<SimRuntime>, Arc<SimWorld>) {
    let mut world_config = config.world.clone();
    if let Some(ram) = config.pool.home_ram {
        if let Some(home) = world_config
            .nodes
            .iter_mut()
            .find(|node| node.name == config.pool.home_node)
        {
            home.max_ram = ram;
        }
    }

    let world = Arc::new(SimWorld::new(config.pool.home_node.clone(), &world_config));
    let runtime = SimRuntime::new(
        config.dispatcher.channel_capacity,
        config.dispatcher.write_retry(),
    );
    for node in &world_config.nodes {
        runtime.add_node(node.name.clone(), node.max_ram);
    }
    register_builtin(&runtime, world.clone(), &world_config);
    register_programs(
        &runtime,
        world.clone(),
        &config.jobs,
        &world_config,
        config.dispatcher.kill_poll(),
    );
    (runtime, world)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    args.apply(&mut config);

    init_logging(&config.logging)?;
    info!("Starting ramlet daemon v{}", env!("CARGO_PKG_VERSION"));

    let (runtime, _world) = build_environment(&config);
    let mut dispatcher = Dispatcher::new(&config, runtime)?;
    dispatcher.install_handlers();
    dispatcher.bootstrap();

    info!(
        inbox_port = config.dispatcher.inbox_port,
        nodes = config.world.nodes.len(),
        targets = config.jobs.targets.len(),
        "Dispatcher ready"
    );

    tokio::select! {
        _ = dispatcher.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
        }
    }
    Ok(())
}
