use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpi::{Config, ProtocolClient, TaskStatus};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cpi", version)]
#[command(about = "Cloud provider interface for the vCloud control plane", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "cpi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and resolve the configured organization and virtual datacenter
    Check,
    /// Poll a task until it reaches a terminal status
    WaitTask {
        /// Task href as returned by the control plane
        #[arg(long)]
        href: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let cancel = CancellationToken::new();
    let client = ProtocolClient::new(&config)
        .context("Failed to create protocol client")?
        .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding requests");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Check => run_check(&config, &client).await,
        Commands::WaitTask { href } => run_wait_task(&client, &href).await,
    }
}

async fn run_check(config: &Config, client: &ProtocolClient) -> Result<()> {
    println!("cpi check");
    println!("=========");
    println!();
    println!("Configuration:");
    println!("  Director: {}", config.director.url);
    println!(
        "  Principal: {}@{}",
        config.director.user, config.director.organization
    );
    println!("  Verify SSL: {}", config.director.verify_ssl);
    println!("  Wait max: {:?}", config.control.wait_max());
    println!("  Wait delay: {:?}", config.control.wait_delay());
    println!(
        "  Retries: {} (initial delay {:?})",
        config.control.retry_max,
        config.control.retry_delay()
    );
    println!();

    let org = client
        .organization()
        .await
        .with_context(|| {
            format!(
                "Failed to resolve organization {}",
                config.director.organization
            )
        })?;
    println!("  [ok] Logged in ({} login(s))", client.login_count());
    println!(
        "  [ok] Organization {} -> {}",
        org.label(),
        org.href().unwrap_or("-")
    );

    match &config.director.virtual_datacenter {
        Some(name) => {
            let vdc = client
                .virtual_datacenter()
                .await
                .with_context(|| format!("Failed to resolve virtual datacenter {}", name))?;
            println!(
                "  [ok] Virtual datacenter {} -> {}",
                vdc.label(),
                vdc.href().unwrap_or("-")
            );
            let running = vdc.tasks()?.iter().filter(|t| !t.status.is_terminal()).count();
            if running > 0 {
                println!("  [!!] {} task(s) still in progress on {}", running, vdc.label());
            }
        }
        None => println!("  [--] No virtual datacenter configured"),
    }

    println!();
    info!("Check passed");
    Ok(())
}

async fn run_wait_task(client: &ProtocolClient, href: &str) -> Result<()> {
    let task = client
        .get(href)
        .await
        .with_context(|| format!("Failed to fetch task {}", href))?
        .to_task()?;
    info!("Waiting for {} ({})", task.ident(), task.operation);

    let done = client.wait_task(task, true).await?;
    println!("{}: {}", done.ident(), done.status);
    if done.status != TaskStatus::Success {
        anyhow::bail!("{}", done.failure_info());
    }
    Ok(())
}
