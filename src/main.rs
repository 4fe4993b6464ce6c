mod bootloader;
mod cli;
mod cloud;
mod config;
mod device;
mod engine;
mod error;
mod execution;
mod logging;
mod retry;
mod scan;

use crate::cli::Cli;
use crate::cloud::WorkerHost;
use crate::cloud::aws::AwsCli;
use crate::config::ShrinkConfig;
use crate::device::LinuxToolkit;
use crate::device::linux::{missing_tools, required_tools};
use crate::engine::ShrinkContext;
use crate::execution::CommandExecutor;
use crate::retry::SystemClock;
use crate::scan::Scanner;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ShrinkConfig::load(cli.config.as_deref())?;
    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| config.default_log_file());
    let _guard = logging::init(&log_file, cli.debug)?;
    info!("volshrink {} starting, logging to {}", env!("CARGO_PKG_VERSION"), log_file.display());

    // discovery and dispatch only talk to the cloud
    let tools = if cli.dry_run || cli.runs_master() {
        vec!["aws".to_string()]
    } else {
        required_tools(&config.filesystem_type)
    };
    let missing = missing_tools(&tools);
    if !missing.is_empty() {
        bail!("required tools not found on PATH: {}", missing.join(", "));
    }

    let worker = WorkerHost::discover()
        .await
        .context("reading the worker identity from instance metadata")?;
    info!(
        "worker {} in {} ({})",
        worker.instance_id, worker.availability_zone, worker.region
    );

    let executor = CommandExecutor::new(config.benign_stderr.clone());
    let cloud = Arc::new(AwsCli::new(executor.clone(), worker.region.clone()));
    let device = Arc::new(LinuxToolkit::new(executor, &config));

    let ctx = ShrinkContext::new(
        Arc::new(config),
        cloud,
        device.clone(),
        Arc::new(SystemClock),
        worker,
    )?;
    let options = cli.scan_options();

    if cli.runs_master() {
        let started = scan::master::dispatch(&ctx, &options).await?;
        println!("{} workers started", started);
        return Ok(());
    }

    let scanner = Scanner::new(ctx.clone(), options);
    if cli.dry_run {
        let plan = scanner.plan().await?;
        scan::print_plan(&plan);
        return Ok(());
    }

    device
        .prepare_work_area(&ctx.slots.mount_dirs())
        .await
        .context("preparing the work area")?;

    let report = scanner.run().await?;
    report.print();
    Ok(())
}
