//! Shelf monitor - simulated enclosure lifecycle service.
//!
//! Builds a port, an enclosure, and one drive per populated slot, plays the
//! configured scenario, and prints the final topology as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use shelf_core::ClassId;
use shelf_monitor::{reschedule_channel, MonitorConfig, MonitorScheduler};
use shelf_topology::{AttributeStore, InMemoryAttributeStore, Topology};
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shelf monitor - simulated enclosure lifecycle service.
#[derive(Parser, Debug)]
#[command(name = "shelf-monitor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,

    /// Override the run time in seconds.
    #[arg(long)]
    run_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shelf=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => MonitorConfig::from_file(path)?,
        None => MonitorConfig::from_env()?,
    };
    if let Some(seconds) = args.run_seconds {
        config.run_seconds = seconds;
    }
    tracing::info!(
        slots = config.scenario.slots.len(),
        events = config.scenario.events.len(),
        run_seconds = config.run_seconds,
        "starting shelf monitor"
    );

    let store = Arc::new(InMemoryAttributeStore::new());
    config.scenario.seed(store.as_ref())?;

    let (hook, requests) = reschedule_channel();
    let topology = Topology::new(
        config.topology_config(),
        Arc::clone(&store) as Arc<dyn AttributeStore>,
        hook,
    )?;

    let (stop, stopped) = oneshot::channel::<()>();
    let scheduler = MonitorScheduler::new(Arc::clone(&topology), requests);
    let scheduler = tokio::spawn(scheduler.run(async {
        let _ = stopped.await;
    }));

    let port = topology.create_port()?;
    let port_object = topology.require(port)?;
    let enclosure = topology.discover_child(&port_object, ClassId::Enclosure, 0)?;
    tracing::info!(%port, %enclosure, "shelf attached");

    let run_time = config.run_time();
    let deadline = tokio::time::Instant::now() + run_time;
    tokio::select! {
        played = config.scenario.play(store.as_ref(), &topology, enclosure, run_time) => {
            let played = played?;
            tracing::info!(events = played, "scenario finished");
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
            }
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    let _ = stop.send(());
    let stats = scheduler.await?;
    tracing::info!(cranks = stats.cranks, errors = stats.errors, "shelf monitor stopped");

    println!("{}", serde_json::to_string_pretty(&topology.snapshot())?);
    Ok(())
}
