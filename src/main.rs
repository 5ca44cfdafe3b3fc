use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use deckhost::config::HostConfig;
use deckhost::host::{HostEvent, HostOptions, ModuleHost};
use deckhost::logger::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "deckhost",
    about = "Control-surface and device orchestration host",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the module host
    Run(RunArgs),

    /// Validate an instance file without starting anything
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Instance definition file
    #[arg(long, default_value = "instances.json")]
    instances: PathBuf,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to daily files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long, default_value = "instances.json")]
    instances: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = HostConfig::load(&args.instances)
        .with_context(|| format!("loading {}", args.instances.display()))?;
    let log_dir = args.log_dir.or_else(|| config.log_dir.clone());
    init_tracing(&args.log_level, log_dir.as_deref())?;

    let mut options = HostOptions::new(config.modules_dir.clone());
    options.instance.module_log_dir = log_dir.map(|dir| dir.join("modules"));

    let (host, mut events) = ModuleHost::new(options);
    for instance in config.instances {
        let id = instance.id.clone();
        if let Err(err) = host.add_instance(instance) {
            warn!("skipping instance `{id}`: {err}");
        }
    }

    // surface module events into the host log until shutdown
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                HostEvent::Lifecycle {
                    instance_id,
                    lifecycle,
                } => info!("instance `{instance_id}` is now {lifecycle:?}"),
                HostEvent::Status {
                    instance_id,
                    status,
                    message,
                } => info!(
                    "instance `{instance_id}` status {status:?}{}",
                    message.map(|m| format!(": {m}")).unwrap_or_default()
                ),
                HostEvent::Variables { instance_id, values } => {
                    info!("instance `{instance_id}` set {} variables", values.len())
                }
                HostEvent::ConfigMigrated {
                    instance_id,
                    upgrade_index,
                    ..
                } => info!(
                    "instance `{instance_id}` migrated its config to index {upgrade_index}"
                ),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    host.shutdown_all().await;
    event_logger.abort();
    Ok(())
}

fn check(args: CheckArgs) -> anyhow::Result<()> {
    let config = HostConfig::load(&args.instances)
        .with_context(|| format!("validating {}", args.instances.display()))?;
    for instance in &config.instances {
        let binary = config.modules_dir.join(&instance.module_id);
        if !binary.is_file() {
            anyhow::bail!(
                "instance `{}`: module binary `{}` not found",
                instance.id,
                binary.display()
            );
        }
    }
    println!(
        "{}: {} instances, modules dir {}",
        args.instances.display(),
        config.instances.len(),
        config.modules_dir.display()
    );
    Ok(())
}
