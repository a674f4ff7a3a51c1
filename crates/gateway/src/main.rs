use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use application::bridge::Bridge;
use application::discovery::{
    DiscoveryScanner, GeneratorOptions, ParameterSpace, ScanObserver, ScanOptions, ScanStrategy,
};
use domain::link::Candidate;
use domain::probe::{DiscoveredDevice, TestAttempt};
use infrastructure::drivers::DriverLoader;
use infrastructure::{GatewayConfig, StateStore, TransportManager};

mod output;

#[derive(Parser, Debug)]
#[command(version, about = "MQTT to Modbus gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MQTT bridge
    Run(RunArgs),
    /// Scan a serial bus for responsive Modbus devices
    Discover(DiscoverArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to a config file
    #[arg(long)]
    config: Option<String>,

    /// Broker url (mqtt, mqtts, ws or wss scheme)
    #[arg(long)]
    mqtt_url: Option<String>,

    #[arg(long)]
    mqtt_client_id: Option<String>,

    #[arg(long)]
    mqtt_username: Option<String>,

    #[arg(long)]
    mqtt_password: Option<String>,

    /// Reconnect period in milliseconds
    #[arg(long)]
    mqtt_reconnect_period: Option<u64>,

    /// Prefix for every published and subscribed topic
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Directory for best-effort state snapshots
    #[arg(long)]
    state_dir: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Quick,
    Thorough,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Table,
    Json,
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    /// Serial port to scan, e.g. /dev/ttyUSB0
    #[arg(long)]
    port: String,

    /// Narrow the scan to a driver's supported link parameters
    #[arg(long)]
    driver: Option<String>,

    #[arg(long, value_enum, default_value_t = StrategyArg::Quick)]
    strategy: StrategyArg,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,

    /// Minimum per-candidate slot time in milliseconds
    #[arg(long, default_value_t = 100)]
    delay: u64,

    /// Stop after this many devices; 0 scans everything
    #[arg(long, default_value_t = 1)]
    max_devices: usize,

    /// Print every probe attempt
    #[arg(long)]
    verbose: bool,

    /// Suppress everything except the final result
    #[arg(long)]
    silent: bool,

    #[arg(long, value_enum, default_value_t = FormatArg::Table)]
    format: FormatArg,
}

async fn run_bridge(args: RunArgs) -> Result<()> {
    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = args.mqtt_url {
        config.mqtt.url = url;
    }
    if let Some(client_id) = args.mqtt_client_id {
        config.mqtt.client_id = Some(client_id);
    }
    if let Some(username) = args.mqtt_username {
        config.mqtt.username = Some(username);
    }
    if let Some(password) = args.mqtt_password {
        config.mqtt.password = Some(password);
    }
    if let Some(period) = args.mqtt_reconnect_period {
        config.mqtt.reconnect_period_ms = period;
    }
    if let Some(prefix) = args.topic_prefix {
        config.mqtt.topic_prefix = prefix;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = Some(dir);
    }

    info!(url = %config.mqtt.url, prefix = %config.mqtt.topic_prefix, "starting bridge");

    let state_store = config.state_dir.as_ref().map(StateStore::new);
    let bridge = Bridge::new(
        config.mqtt.clone(),
        Arc::new(DriverLoader::new()),
        Arc::new(TransportManager),
        state_store,
    );

    for device in config.devices {
        let device_id = device.device_id.clone();
        bridge
            .add_device(device)
            .await
            .with_context(|| format!("failed to add device {device_id}"))?;
    }

    bridge.start().await.context("failed to start bridge")?;
    info!("bridge running, press Ctrl-C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(err) => warn!(error = %err, "unable to listen for shutdown signal"),
    }
    bridge.stop().await?;
    Ok(())
}

struct CliObserver {
    verbose: bool,
    silent: bool,
}

impl ScanObserver for CliObserver {
    fn on_test_attempt(&self, candidate: &Candidate, state: TestAttempt) -> domain::Result<()> {
        if self.verbose && !self.silent && state != TestAttempt::Testing {
            println!(
                "{} slave {:>3} ... {}",
                candidate.link,
                candidate.slave_id,
                state.as_str()
            );
        }
        Ok(())
    }

    fn on_device_found(&self, device: &DiscoveredDevice) -> domain::Result<()> {
        if !self.silent {
            println!(
                "Found device at slave {} ({}, {} ms)",
                device.slave_id, device.link, device.probe.response_time_ms
            );
        }
        Ok(())
    }
}

async fn run_discover(args: DiscoverArgs) -> Result<()> {
    let loader = DriverLoader::new();
    let mut scanner = DiscoveryScanner::new(Arc::new(TransportManager));
    let mut supported = None;
    if let Some(name) = &args.driver {
        let spec = loader
            .resolve(Some(name))
            .with_context(|| format!("cannot use driver {name} for scanning"))?;
        supported = spec.supported.clone();
        scanner = scanner.with_probe_driver(spec);
    }

    let space = ParameterSpace::new(&GeneratorOptions {
        strategy: match args.strategy {
            StrategyArg::Quick => ScanStrategy::Quick,
            StrategyArg::Thorough => ScanStrategy::Thorough,
        },
        supported,
    });
    let options = ScanOptions {
        port: args.port.clone(),
        timeout_ms: args.timeout,
        delay_ms: args.delay,
        max_devices: args.max_devices,
        verbose: args.verbose,
    };

    if !args.silent {
        println!("Scanning {} ({} candidates)...", args.port, space.total());
    }
    let started = std::time::Instant::now();
    let observer = CliObserver {
        verbose: args.verbose,
        silent: args.silent,
    };
    let result = scanner.scan(&space, &options, &observer).await?;

    match args.format {
        FormatArg::Table => println!("{}", output::render_table(&result)),
        FormatArg::Json => println!("{}", output::render_json(&result)?),
    }
    if !args.silent {
        println!(
            "Found {} device(s) in {:.1}s",
            result.len(),
            started.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

async fn run() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();

    // the discovery CLI prints its own progress; keep tracing quiet there
    let default_filter = match &cli.command {
        Command::Discover(args) if !args.verbose => "warn",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Run(args) => run_bridge(args).await,
        Command::Discover(args) => run_discover(args).await,
    }
}

fn main() {
    let rt = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    if let Err(err) = rt.block_on(run()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
