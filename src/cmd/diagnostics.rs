//! Diagnostics command - connectivity probes for the runtime and provider

use anyhow::Result;

use fleet_daemon::config::Configuration;
use fleet_daemon::docker::DockerDriver;
use fleet_daemon::provider::{HttpProviderClient, ProviderClient};

/// Probe the container runtime and the provider and print a summary
pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;

    println!("fleet-daemon diagnostics");
    println!("------------------------");
    println!("config file:     {}", config_path);
    println!("provider url:    {}", config.provider.url);
    println!("provider scope:  {}/{}", config.provider.org, config.provider.repo);
    println!("docker socket:   {}", config.docker.socket);
    println!("runner image:    {}", config.docker.runner.image);
    println!();

    match DockerDriver::new(&config.docker) {
        Ok(driver) => match driver.ping().await {
            Ok(()) => println!("container runtime: OK"),
            Err(e) => println!("container runtime: FAILED ({})", e),
        },
        Err(e) => println!("container runtime: FAILED ({})", e),
    }

    match HttpProviderClient::new(&config.provider) {
        Ok(client) => match client.list_runners(&config.provider.repo).await {
            Ok(runners) => {
                println!("provider API:      OK ({} runner(s) listed)", runners.len());
                for runner in runners.iter().take(10) {
                    println!(
                        "  - {} (id {}, {:?}, busy={})",
                        runner.name, runner.id, runner.status, runner.busy
                    );
                }
            }
            Err(e) => println!("provider API:      FAILED ({})", e),
        },
        Err(e) => println!("provider API:      FAILED ({})", e),
    }

    Ok(())
}
