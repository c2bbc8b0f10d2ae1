//! dashlink - vehicle computer to display bridge
//!
//! Runs the serial link to the display and the fuel accountant, sharing one
//! telemetry record between them. With `--demo` a simulated drive feeds the
//! record in place of the vehicle decoder.
//!
//! Usage: dashlink [--config <path>] [--port <name>] [--demo]

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dashlink_core::prelude::*;
use dashlink_core::protocol::list_ports;

#[derive(Parser, Debug)]
#[command(name = "dashlink")]
#[command(about = "Bridge vehicle telemetry to the dash display", version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the display (overrides the configuration)
    #[arg(short, long)]
    port: Option<String>,

    /// Drive simulated telemetry instead of waiting for a vehicle decoder
    #[arg(long)]
    demo: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Clear lifetime fuel statistics before starting
    #[arg(long)]
    reset_fuel_stats: bool,
}

/// Logs display events
struct LogListener;

impl LinkListener for LogListener {
    fn on_screen_changed(&self, screen: u8) {
        info!(screen, "display changed screen");
    }

    fn on_setting_changed(&self, name: &str, value: &SettingValue) {
        info!(name, %value, "display changed setting");
    }

    fn on_settings_synced(&self, settings: &BTreeMap<String, SettingValue>) {
        info!(count = settings.len(), "display sent its settings");
    }

    fn on_selection_changed(&self, index: u8) {
        info!(index, "display selection changed");
    }

    fn on_connection_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => info!("display link up"),
            ConnectionState::Disconnected => info!("display link down"),
            ConnectionState::Connecting => {}
        }
    }
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {:04x}:{:04x}  {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
}

/// Feed the accountant from the telemetry record and publish its outputs back
async fn run_fuel(telemetry: SharedTelemetry, accountant: Arc<FuelAccountant>) {
    let period = Duration::from_millis(accountant.config().update_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;

        let sample = telemetry.read(|t| FuelSample {
            speed_mph: f64::from(t.speed_mph),
            raw_fuel_pct: t.fuel_raw_pct.map(f64::from),
            engine_running: t.engine_running,
        });
        // Updates may save to disk; keep that off the runtime threads
        let acc = accountant.clone();
        let out = match tokio::task::spawn_blocking(move || acc.update(sample)).await {
            Ok(out) => out,
            Err(e) => {
                warn!("fuel update task failed: {}", e);
                continue;
            }
        };
        telemetry.update(|t| {
            t.fuel_pct = out.smoothed_fuel_pct.map(|p| p as f32);
            t.range_miles = out.range_miles;
        });
    }
}

async fn run_demo(telemetry: SharedTelemetry) {
    let mut drive = DemoDrive::new();
    let start = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        telemetry.update(|t| drive.update(elapsed_ms, t));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_ports {
        print_ports();
        return Ok(());
    }

    let mut config = BridgeConfig::load_or_default(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.link.port_name = port;
    }
    info!(
        version = dashlink_core::VERSION,
        data_dir = %config.storage.data_dir.display(),
        "starting dashlink"
    );

    let telemetry = SharedTelemetry::new();
    let sender = LinkSender::new(&config.link);
    let settings = Arc::new(SettingsSync::new(sender.clone()));
    let tpms = TpmsCache::load(config.storage.tpms_cache_path());
    let accountant = Arc::new(FuelAccountant::load(
        config.fuel.clone(),
        config.storage.fuel_stats_path(),
    ));
    if args.reset_fuel_stats {
        let acc = accountant.clone();
        tokio::task::spawn_blocking(move || acc.reset_lifetime())
            .await
            .context("fuel reset task failed")?;
    }

    if !config.link.resync_settings_on_connect {
        // Adopt the display's settings instead of pushing ours
        settings.request_all();
    }

    let link = SerialLink::new(
        config.link.clone(),
        sender,
        telemetry.clone(),
        tpms,
        settings,
        Arc::new(LogListener),
    );
    link.start().context("failed to start display link")?;

    let fuel_task = tokio::spawn(run_fuel(telemetry.clone(), accountant.clone()));
    let demo_task = args.demo.then(|| {
        info!("demo drive enabled");
        tokio::spawn(run_demo(telemetry.clone()))
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    fuel_task.abort();
    if let Some(task) = demo_task {
        task.abort();
    }

    let stats = tokio::task::spawn_blocking(move || {
        link.stop();
        link.stats()
    })
    .await
    .context("link shutdown task failed")?;
    info!(
        tx_lines = stats.tx_lines,
        rx_lines = stats.rx_lines,
        connects = stats.connects,
        decode_errors = stats.decode_errors,
        line_overflows = stats.line_overflows,
        dropped_commands = stats.dropped_commands,
        "display link closed"
    );

    let acc = accountant.clone();
    tokio::task::spawn_blocking(move || acc.flush())
        .await
        .context("fuel flush task failed")?;
    if let Some(out) = accountant.outputs().range_miles {
        info!(range_miles = out, "final range estimate");
    } else {
        warn!("no fuel reading seen this run");
    }
    Ok(())
}
