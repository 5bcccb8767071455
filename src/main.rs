//! peerwire - reliable peer-to-peer messaging for distributed runs
//!
//! Entry point of the `peerwire` binary. `peerwire run` joins a run,
//! gathers one value from every instance on the multi-node leader and
//! broadcasts the gathered count back to everyone.

mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use peerwire::communicator::Communicator;
use peerwire::config::{self, NodeConfig};
use peerwire::error::Error;
use peerwire::logging;
use peerwire::version;

use crate::cli::{Cli, Commands, ConfigSubcommand};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config_path, instance_name, local_position, gather) = match cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN);
            return handle_config_command(subcommand);
        }
        Commands::Run {
            config,
            instance_name,
            local_position,
            gather,
        } => (config, instance_name, local_position, gather),
    };

    let mut config = load_or_exit(config_path.as_deref());

    // CLI arguments take precedence over file and environment
    if instance_name.is_some() {
        config.instance.name = instance_name;
    }
    if let Some(position) = local_position {
        config.instance.local_position = position;
    }
    if let Err(e) = config.validate() {
        exit_with(&e);
    }

    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting peerwire"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("peerwire")
        .build()
        .context("failed to create async runtime")?;

    if let Err(e) = runtime.block_on(run(config, gather)) {
        error!(error = %e.format_for_log(), "Run failed");
        exit_with(&e);
    }
    Ok(())
}

async fn run(config: NodeConfig, gather: Option<String>) -> peerwire::error::Result<()> {
    let runtime_config = config.communicator_config();
    let value = gather.unwrap_or_else(|| runtime_config.instance_name.clone());
    info!(
        instance = %runtime_config.instance_name,
        group = %runtime_config.group_identifier,
        node = %runtime_config.node_name,
        local_position = runtime_config.local_position,
        instances_per_node = runtime_config.instances_per_node,
        number_of_nodes = runtime_config.number_of_nodes,
        "Configuration loaded"
    );

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let communicator = tokio::select! {
        communicator = Communicator::new(runtime_config) => communicator?,
        _ = &mut shutdown_signal => {
            info!("Shutdown signal received during discovery");
            return Ok(());
        }
    };

    let outcome = tokio::select! {
        outcome = exchange(&communicator, value) => outcome,
        _ = &mut shutdown_signal => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    communicator.stop().await;
    info!("Communicator stopped");
    outcome
}

/// Gather every value on the leader, then broadcast how many arrived
async fn exchange(communicator: &Communicator, value: String) -> peerwire::error::Result<()> {
    let gathered = communicator.gather(value.into_bytes()).await?;

    let summary = match gathered {
        Some(values) => {
            for value in &values {
                println!("{}", String::from_utf8_lossy(value));
            }
            Some(values.len().to_string().into_bytes())
        }
        None => None,
    };

    let count = communicator.broadcast(summary).await?;
    info!(
        instances = %String::from_utf8_lossy(&count),
        multi_node_leader = communicator.is_multi_node_leader(),
        "Broadcast received"
    );
    Ok(())
}

fn load_or_exit(path: Option<&str>) -> NodeConfig {
    match NodeConfig::load(path) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    }
}

fn exit_with(e: &Error) -> ! {
    eprint!("{}", e.format_for_terminal());
    std::process::exit(e.exit_code());
}

fn handle_config_command(subcommand: ConfigSubcommand) -> anyhow::Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = load_or_exit(config.as_deref());
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            match config::init_config(path.as_deref(), force) {
                Ok(path) => println!("Configuration file created: {}", path.display()),
                Err(e) => exit_with(&e),
            }
        }
        ConfigSubcommand::Validate { config } => {
            let cfg = load_or_exit(config.as_deref());
            if cfg.forwarding.enabled && cfg.group.instances_per_node == 1 && cfg.group.number_of_nodes == 1 {
                warn!("Forwarding has no effect in a single-instance run");
            }
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
