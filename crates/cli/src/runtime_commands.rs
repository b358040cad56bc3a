//! One-shot commands that talk to the runtime without supervising.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    podvisor_config::PodvisorConfig,
    podvisor_lifecycle::{LifecycleTimings, WorkloadSpec},
    podvisor_runtime::{CliRunner, RuntimeGateway},
};

fn gateway(config: &PodvisorConfig) -> RuntimeGateway {
    RuntimeGateway::new(Arc::new(CliRunner::from_config(&config.runtime)), &config.runtime)
}

pub async fn status(config: &PodvisorConfig, json: bool) -> Result<()> {
    let gateway = gateway(config);
    let name = &config.workload.name;
    let binary = gateway
        .prepare()
        .await
        .context("container runtime unavailable")?;
    let rows = gateway.query(name).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    eprintln!("runtime: {}", binary.display());
    match rows.first() {
        Some(row) => {
            println!("{name}: {} ({}, {})", row.state, row.short_id(), row.status);
            ports(config);
        },
        None => println!("{name}: not running"),
    }
    Ok(())
}

/// Stop a workload this process does not own: graceful `stop`, then `rm`.
pub async fn stop(config: &PodvisorConfig) -> Result<()> {
    let gateway = gateway(config);
    let name = &config.workload.name;
    let timings = LifecycleTimings::from(&config.lifecycle);
    gateway.prepare().await?;

    if gateway.query(name).await?.is_empty() {
        println!("{name} is not running");
        return Ok(());
    }

    eprintln!("Stopping {name}...");
    if let Err(e) = gateway
        .terminate(name, timings.stop_grace, timings.stop_slack)
        .await
    {
        eprintln!("graceful stop failed ({e}), forcing removal");
        gateway.remove_stale(name).await?;
    }
    gateway.remove(name).await?;

    if gateway.query(name).await?.is_empty() {
        println!("{name} stopped");
        Ok(())
    } else {
        anyhow::bail!("{name} is still present after stop")
    }
}

pub fn ports(config: &PodvisorConfig) {
    for endpoint in WorkloadSpec::from_config(config).endpoints("localhost") {
        println!(
            "  {:<10} {:<32} {}",
            endpoint.name, endpoint.url, endpoint.description
        );
    }
}
