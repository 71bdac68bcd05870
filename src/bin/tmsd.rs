use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use trixel_management_node::config::{load_config, Config, ConfigFormat};
use trixel_management_node::lookup::{
    DelegationSync, HttpLookupClient, LookupClient, Registration, ScriptedLookupClient,
};
use trixel_management_node::store::TrixelDelegation;
use trixel_management_node::types::{SensorType, TrixelId};
use trixel_management_node::TmsNode;

#[derive(Debug, Parser)]
#[command(name = "tmsd", version, about = "Trixel management server node")]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/tms.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Run against a scripted in-memory lookup service with synthetic
    /// stations instead of a real one.
    #[arg(long)]
    demo: bool,
    /// Evaluation cycles to run in demo mode before exiting.
    #[arg(long, default_value_t = 10)]
    demo_cycles: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    // Demo mode works without a config file on disk.
    let config = if cli.demo && !cli.config.exists() {
        Config::sample()
    } else {
        load_config(&cli.config, cli.config_format)?
    };

    if cli.demo {
        return demo(config, cli.demo_cycles).await;
    }

    let client = Arc::new(HttpLookupClient::new(
        &config.lookup.base_url(),
        config.lookup.request_timeout(),
    )?);
    serve(config, client).await
}

async fn serve(config: Config, client: Arc<dyn LookupClient>) -> anyhow::Result<()> {
    let node = TmsNode::new(config, client);
    let tasks = node.spawn();
    tracing::info!("node started, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for task in tasks {
        task.abort();
    }
    println!("{}", serde_json::to_string_pretty(&node.status())?);
    Ok(())
}

/// Self-contained run: a scripted lookup service delegates one root trixel,
/// five synthetic stations report random-walk readings, and each cycle's
/// published observation is printed.
async fn demo(mut config: Config, cycles: u32) -> anyhow::Result<()> {
    config.engine.trixel_update_frequency_s = 1;

    let root = TrixelId::from_raw(9).context("valid root trixel")?;
    let client = Arc::new(ScriptedLookupClient::new());
    client.push_registration(Ok(Registration {
        id: 1,
        token: "demo-token".into(),
        active: true,
    }));
    client.push_sync(Ok(DelegationSync {
        active: true,
        delegations: vec![TrixelDelegation {
            trixel: root,
            exclude: false,
        }],
    }));

    let node = TmsNode::new(config, client);
    node.manager().sync_once().await?;

    let mut stations = Vec::new();
    for _ in 0..5 {
        let station = node.register_station(
            root,
            vec![SensorType::AmbientTemperature, SensorType::RelativeHumidity],
        )?;
        stations.push(station);
    }

    let mut temperature = 20.0f64;
    let mut humidity = 55.0f64;
    for cycle in 0..cycles {
        temperature += rand::thread_rng().gen_range(-0.3..=0.3);
        humidity = (humidity + rand::thread_rng().gen_range(-1.0..=1.0)).clamp(0.0, 100.0);
        let now = Utc::now();
        for (id, token) in &stations {
            let value = temperature + rand::thread_rng().gen_range(-0.2..=0.2);
            node.ingest(id, token, root, SensorType::AmbientTemperature, value, now)?;
            let value = humidity + rand::thread_rng().gen_range(-0.5..=0.5);
            node.ingest(id, token, root, SensorType::RelativeHumidity, value, now)?;
        }

        let report = node.engine().run_cycle(now);
        for sensor_type in SensorType::ALL {
            if let Some(observation) = node.observations().latest(root, sensor_type) {
                println!(
                    "cycle {:>2}: published {} suppressed {} | {} {:.2} (quality {:.3}, {} stations)",
                    cycle + 1,
                    report.published,
                    report.suppressed,
                    sensor_type,
                    observation.value,
                    observation.quality,
                    observation.contributors
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("{}", serde_json::to_string_pretty(&node.status())?);
    Ok(())
}
