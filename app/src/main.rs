use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleet_core::config::{
    DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, DEFAULT_DEVICES, DEFAULT_HISTORY_LIMIT,
    DEFAULT_HOURS_BACK, DEFAULT_INTERVAL_MINUTES, DEFAULT_MEASUREMENT, DEFAULT_MESSAGES,
    DEFAULT_RATE, DEFAULT_REPORT_EVERY, DEFAULT_SNAPSHOT_WINDOW, DEFAULT_STREAM_RATE,
    DEFAULT_TOPIC,
};
use fleet_core::{
    BackfillConfig, BrokerConfig, Delivery, DuckDbStore, HistoricalBackfillPublisher, LiveConfig,
    LivePublisher, PublishReport, QueryConfig, StorageMode,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

mod check;
mod ingest;
mod logging;
mod server;
mod transport;

use transport::Transport;

#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(about = "Sensor fleet simulator: publish synthetic readings, ingest them and serve snapshots.", long_about = None)]
struct Cli {
    /// Mirror log output to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish generated readings (batch, historical backfill or continuous stream).
    Publish(PublishArgs),
    /// Publish a single probe reading to verify the broker.
    Check(BrokerArgs),
    /// Subscribe to the topic and store every reading.
    Ingest(IngestArgs),
    /// Serve the read API, ingesting in the same process unless disabled.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct BrokerArgs {
    #[arg(long, env = "MQTT_BROKER", default_value = DEFAULT_BROKER_HOST)]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = DEFAULT_BROKER_PORT)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = DEFAULT_TOPIC)]
    topic: String,

    #[arg(long, value_enum, default_value_t = Transport::Mqtt)]
    transport: Transport,

    #[arg(long, default_value = "fleet_publisher")]
    client_id: String,

    #[arg(long, default_value_t = 60)]
    connect_timeout_secs: u64,

    /// Upper bound on how long disconnect waits for queued messages.
    #[arg(long, default_value_t = 2_000)]
    drain_ms: u64,
}

impl BrokerArgs {
    fn config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.broker.clone(),
            port: self.port,
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            drain: Duration::from_millis(self.drain_ms),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Batch,
    Historical,
    Stream,
}

#[derive(Args, Debug)]
struct PublishArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    #[arg(long, value_enum, default_value_t = Mode::Batch)]
    mode: Mode,

    /// Messages to send in batch mode.
    #[arg(long, default_value_t = DEFAULT_MESSAGES)]
    messages: u64,

    #[arg(long, default_value_t = DEFAULT_DEVICES)]
    devices: u32,

    /// Messages per second. Defaults to 100 for batch and 2 for stream.
    #[arg(long, allow_negative_numbers = true)]
    rate: Option<f64>,

    /// Historical window length.
    #[arg(long, default_value_t = DEFAULT_HOURS_BACK, allow_negative_numbers = true)]
    hours: i64,

    /// Historical step in minutes.
    #[arg(long, default_value_t = DEFAULT_INTERVAL_MINUTES, allow_negative_numbers = true)]
    interval: i64,

    /// Pause between historical steps.
    #[arg(long, default_value_t = 10)]
    step_pause_ms: u64,

    /// Fix the random source so runs repeat.
    #[arg(long)]
    seed: Option<u64>,

    /// MQTT QoS: 0 sends at most once, 1 at least once.
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    qos: u8,
}

impl PublishArgs {
    fn delivery(&self) -> Delivery {
        match self.qos {
            0 => Delivery::AtMostOnce,
            _ => Delivery::AtLeastOnce,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Storage {
    Memory,
    Disk,
    Both,
}

impl From<Storage> for StorageMode {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::Memory => StorageMode::Memory,
            Storage::Disk => StorageMode::Disk,
            Storage::Both => StorageMode::Both,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    #[arg(long, default_value = "data/fleet.duckdb")]
    db: PathBuf,

    #[arg(long, value_enum, default_value_t = Storage::Disk)]
    storage: Storage,

    #[arg(long, default_value = DEFAULT_MEASUREMENT)]
    measurement: String,
}

impl StoreArgs {
    fn open(&self) -> Result<DuckDbStore> {
        let mode = StorageMode::from(self.storage);
        if mode == StorageMode::Memory {
            return DuckDbStore::in_memory().context("open in-memory store");
        }
        if let Some(parent) = self.db.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
        let store = DuckDbStore::new(&self.db, mode)
            .with_context(|| format!("open store {}", self.db.display()))?;
        info!(path = %self.db.display(), mode = ?store.mode(), "store opened");
        Ok(store)
    }
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[arg(long, default_value = server::DEFAULT_BIND)]
    bind: String,

    /// Readings scanned to build the latest-state snapshot.
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_WINDOW)]
    window: usize,

    /// Maximum points returned by the history endpoint.
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,

    /// Only serve; another process owns ingest.
    #[arg(long)]
    no_ingest: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        let shutdown = shutdown_signal();
        match cli.command {
            Command::Publish(args) => publish(args, shutdown).await,
            Command::Check(args) => {
                check::run(args.transport, &args.config()).await?;
                Ok(())
            }
            Command::Ingest(args) => {
                let store = Arc::new(Mutex::new(args.store.open()?));
                ingest::run(
                    args.broker.transport,
                    args.broker.config(),
                    store,
                    args.store.measurement.clone(),
                    shutdown,
                )
                .await?;
                Ok(())
            }
            Command::Serve(args) => serve(args, shutdown).await,
        }
    })
}

/// Flips to `true` on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = tx.send(true);
            }
            Err(err) => warn!("ctrl-c handler unavailable: {err}"),
        }
    });
    rx
}

async fn publish(args: PublishArgs, shutdown: watch::Receiver<bool>) -> Result<()> {
    let broker = args.broker.config();
    broker.validate()?;
    let mut channel = transport::channel_for(args.broker.transport, &broker);

    let report = match args.mode {
        Mode::Batch | Mode::Stream => {
            let config = if args.mode == Mode::Batch {
                LiveConfig {
                    seed: args.seed,
                    delivery: args.delivery(),
                    ..LiveConfig::batch(
                        args.messages,
                        args.devices,
                        args.rate.unwrap_or(DEFAULT_RATE),
                    )
                }
            } else {
                LiveConfig {
                    seed: args.seed,
                    delivery: args.delivery(),
                    ..LiveConfig::stream(args.devices, args.rate.unwrap_or(DEFAULT_STREAM_RATE))
                }
            };
            let mut publisher = LivePublisher::new(config, broker.topic.as_str())?;
            publisher.run(channel.as_mut(), shutdown).await?
        }
        Mode::Historical => {
            let config = BackfillConfig {
                devices: args.devices,
                hours_back: args.hours,
                step_minutes: args.interval,
                step_pause: Duration::from_millis(args.step_pause_ms),
                report_every: DEFAULT_REPORT_EVERY,
                seed: args.seed,
                delivery: args.delivery(),
            };
            let mut publisher = HistoricalBackfillPublisher::new(config, broker.topic.as_str())?;
            publisher.run(channel.as_mut(), shutdown).await?
        }
    };

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &PublishReport) {
    println!("total sent:    {}", report.sent());
    println!("failed:        {}", report.failed);
    println!("elapsed:       {:.2}s", report.elapsed.as_secs_f64());
    println!("average rate:  {:.1} msg/s", report.average_rate());
    if let Some((from, until)) = report.window {
        println!("window:        {from} .. {until}");
    }
    if report.cancelled {
        println!("stopped early by interrupt");
    }
}

async fn serve(args: ServeArgs, shutdown: watch::Receiver<bool>) -> Result<()> {
    let store = Arc::new(Mutex::new(args.store.open()?));
    let query = QueryConfig {
        measurement: args.store.measurement.clone(),
        snapshot_window: args.window,
        history_limit: args.history_limit,
    };

    let ingest_task = if args.no_ingest {
        None
    } else {
        let transport = args.broker.transport;
        let broker = args.broker.config();
        let store = store.clone();
        let measurement = query.measurement.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = ingest::run(transport, broker, store, measurement, shutdown).await {
                error!("ingest stopped: {err:#}");
            }
        }))
    };

    let state = server::AppState::new(store, &query);
    let served = server::serve(&args.bind, state, shutdown).await;
    if let Some(task) = ingest_task {
        if served.is_ok() {
            if let Err(err) = task.await {
                error!("ingest task failed: {err}");
            }
        } else {
            task.abort();
        }
    }
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn historical_flags_parse() {
        let cli = Cli::try_parse_from([
            "fleet", "publish", "--mode", "historical", "--hours", "2", "--interval", "15",
            "--transport", "dry-run",
        ])
        .expect("parse");
        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.mode, Mode::Historical);
        assert_eq!(args.hours, 2);
        assert_eq!(args.interval, 15);
        assert_eq!(args.broker.transport, Transport::DryRun);
        assert_eq!(args.rate, None);
        assert_eq!(args.devices, DEFAULT_DEVICES);
        assert_eq!(args.delivery(), Delivery::AtMostOnce);
    }

    #[test]
    fn qos_selects_delivery() {
        let cli = Cli::try_parse_from(["fleet", "publish", "--qos", "1"]).expect("parse");
        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.delivery(), Delivery::AtLeastOnce);
        assert!(Cli::try_parse_from(["fleet", "publish", "--qos", "2"]).is_err());
    }

    #[test]
    fn negative_rate_reaches_validation() {
        let cli = Cli::try_parse_from(["fleet", "publish", "--rate", "-5"]).expect("parse");
        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        let config = LiveConfig::batch(args.messages, args.devices, args.rate.unwrap_or(DEFAULT_RATE));
        assert!(LivePublisher::new(config, "t").is_err());
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["fleet", "serve", "--no-ingest"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.no_ingest);
        assert_eq!(args.bind, "0.0.0.0:5000");
        assert_eq!(args.window, 100);
        assert_eq!(args.history_limit, 50);
        assert_eq!(args.store.measurement, "mqtt_consumer");
    }
}
