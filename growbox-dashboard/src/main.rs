// Growbox Dashboard - Acquisition daemon and HTTP dashboard
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Growbox Dashboard
//!
//! Samples the climate sensors and power meters, stores every reading in
//! SQLite and serves the live and historical view over HTTP, optionally
//! relaying a camera stream as HLS.
//!
//! ## Usage
//!
//! ```bash
//! # Development run against the simulated bus
//! growbox-dashboard --simulate --port 8080
//!
//! # Real hardware, one Shelly plug, camera relay
//! growbox-dashboard --db /var/lib/growbox/sensors.db \
//!     --power-meter grow-light=192.168.1.40 \
//!     --rtsp-url rtsp://192.168.1.50/stream1
//! ```

mod api;
mod export;
mod metrics;
mod relay;
mod system;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use api::{router, AppState};
use clap::Parser;
use embedded_hal::i2c::I2c;
use growbox::{
    ConfigError, DeviceClass, HistoryConfig, HistoryEngine, LiveCache, LiveConfig, SensorId,
    SharedLiveCache, StorageError, Store, StoreConfig,
};
use growbox_gateway::{
    AcquisitionStats, Bme280Adapter, BusConfig, GatewayError, MuxedBus, PowerMeterConfig,
    Scheduler, SchedulerConfig, ShellyAdapter,
};
use relay::{Relay, RelayConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Growbox monitoring daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "GROWBOX_PORT", default_value = "5000")]
    port: u16,

    /// SQLite database file
    #[arg(long, env = "GROWBOX_DB", default_value = "sensors.db")]
    db: PathBuf,

    /// Days of readings to keep
    #[arg(long, env = "GROWBOX_RETENTION_DAYS", default_value = "40")]
    retention_days: u64,

    /// Minimum seconds between two retention prunes (0 = every write)
    #[arg(long, env = "GROWBOX_PRUNE_INTERVAL", default_value = "3600")]
    prune_interval: u64,

    /// I2C bus device
    #[arg(long, env = "GROWBOX_I2C_BUS", default_value = "/dev/i2c-1")]
    i2c_bus: PathBuf,

    /// Multiplexer address, or "none" for sensors wired directly
    #[arg(long, env = "GROWBOX_MUX_ADDRESS", default_value = "0x70")]
    mux_address: String,

    /// Multiplexer channels to scan
    #[arg(long, env = "GROWBOX_CHANNELS", value_delimiter = ',', default_value = "0,1")]
    channels: Vec<u8>,

    /// Sensor addresses probed on every channel
    #[arg(long, env = "GROWBOX_ADDRESSES", value_delimiter = ',', default_value = "0x76,0x77", value_parser = parse_address)]
    addresses: Vec<u8>,

    /// Milliseconds to wait after switching channels
    #[arg(long, env = "GROWBOX_SETTLE_DELAY_MS", default_value = "2")]
    settle_delay_ms: u64,

    /// Seconds between two climate cycles
    #[arg(long, env = "GROWBOX_SAMPLE_PERIOD", default_value = "60")]
    sample_period: u64,

    /// Seconds between two power meter cycles
    #[arg(long, env = "GROWBOX_POWER_PERIOD", default_value = "30")]
    power_period: u64,

    /// Milliseconds allowed for one sensor read
    #[arg(long, env = "GROWBOX_READ_TIMEOUT_MS", default_value = "2000")]
    read_timeout_ms: u64,

    /// Exit when no climate sensor answers the startup scan
    #[arg(long, env = "GROWBOX_REQUIRE_SENSORS")]
    require_sensors: bool,

    /// Shelly switch to poll, as [name=]host[#switch]; repeatable
    #[arg(long = "power-meter", env = "GROWBOX_POWER_METERS", value_delimiter = ',')]
    power_meters: Vec<String>,

    /// Windows per chart series; a series holds at most twice as many points
    #[arg(long, env = "GROWBOX_MAX_POINTS", default_value = "500")]
    max_points: usize,

    /// Default /history window in hours
    #[arg(long, env = "GROWBOX_HISTORY_HOURS", default_value = "24")]
    history_hours: u64,

    /// Samples kept per sensor in the live buffers
    #[arg(long, env = "GROWBOX_LIVE_CAPACITY", default_value = "100")]
    live_capacity: usize,

    /// RTSP camera stream to relay as HLS
    #[arg(long, env = "GROWBOX_RTSP_URL")]
    rtsp_url: Option<String>,

    /// Directory for the HLS playlist and segments
    #[arg(long, env = "GROWBOX_HLS_DIR", default_value = "hls")]
    hls_dir: PathBuf,

    /// ffmpeg executable used by the relay
    #[arg(long, env = "GROWBOX_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Use the simulated sensor bus instead of the hardware
    #[arg(long, env = "GROWBOX_SIMULATE")]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GROWBOX_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_address(raw: &str) -> Result<u8, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse::<u8>(),
    };
    parsed.map_err(|_| format!("invalid I2C address '{}'", raw))
}

fn parse_mux_address(raw: &str) -> Result<Option<u8>, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "none" | "off" => Ok(None),
        _ => parse_address(raw).map(Some),
    }
}

/// Fatal startup failures.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Args {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            prune_interval: Duration::from_secs(self.prune_interval),
            ..StoreConfig::with_path(&self.db).with_retention_days(self.retention_days)
        }
    }

    fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            max_points: self.max_points,
            window: Duration::from_secs(self.history_hours.saturating_mul(3600)),
        }
    }

    fn live_config(&self) -> LiveConfig {
        LiveConfig {
            capacity: self.live_capacity,
        }
    }

    fn bus_config(&self) -> Result<BusConfig, ConfigError> {
        let mux_address = parse_mux_address(&self.mux_address)
            .map_err(|reason| ConfigError::invalid("mux_address", reason))?;
        Ok(BusConfig {
            device: self.i2c_bus.clone(),
            mux_address,
            channels: self.channels.clone(),
            addresses: self.addresses.clone(),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        })
    }

    fn climate_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            require_sensors: self.require_sensors,
            ..SchedulerConfig::climate().with_period(Duration::from_secs(self.sample_period))
        }
    }

    fn power_config(&self) -> SchedulerConfig {
        SchedulerConfig::power().with_period(Duration::from_secs(self.power_period))
    }

    fn meters(&self) -> Result<Vec<PowerMeterConfig>, ConfigError> {
        self.power_meters
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| PowerMeterConfig::parse(raw))
            .collect()
    }

    fn relay_config(&self) -> Option<RelayConfig> {
        let source = self.rtsp_url.as_deref()?.trim();
        if source.is_empty() {
            return None;
        }
        Some(RelayConfig {
            program: self.ffmpeg.clone(),
            ..RelayConfig::new(source, &self.hls_dir)
        })
    }
}

/// Background task handles awaited at shutdown.
type Tasks = Vec<(&'static str, JoinHandle<()>)>;

/// Scan the climate bus and start its loop.
async fn start_climate<I>(
    bus: MuxedBus<I>,
    bus_config: &BusConfig,
    config: SchedulerConfig,
    store: &Arc<Store>,
    live: &SharedLiveCache,
    shutdown: watch::Receiver<bool>,
    tasks: &mut Tasks,
) -> Result<Arc<AcquisitionStats>, StartupError>
where
    I: I2c + Send + 'static,
{
    let adapter = Bme280Adapter::new(bus.into_shared(), bus_config);
    let mut scheduler = Scheduler::new(adapter, config, Arc::clone(store), Arc::clone(live));
    scheduler.scan().await?;
    let stats = scheduler.stats();

    tasks.push((
        "climate acquisition",
        tokio::spawn(async move {
            if let Err(e) = scheduler.run(shutdown).await {
                error!("Climate acquisition stopped: {}", e);
            }
        }),
    ));
    Ok(stats)
}

async fn run(args: Args) -> Result<(), StartupError> {
    let store_config = args.store_config();
    let history_config = args.history_config();
    let live_config = args.live_config();
    let bus_config = args.bus_config()?;
    let climate_config = args.climate_config();
    let power_config = args.power_config();
    let meters = args.meters()?;
    let relay_config = args.relay_config();

    store_config.validate()?;
    history_config.validate()?;
    live_config.validate()?;
    bus_config.validate()?;
    climate_config.validate()?;
    power_config.validate()?;
    if let Some(relay) = &relay_config {
        relay.validate()?;
    }

    let store = Arc::new(Store::open(store_config)?);
    let live = LiveCache::shared(&live_config);
    info!("Store opened: {} rows", store.row_count()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Tasks = Vec::new();
    let mut acquisition = Vec::new();

    // Climate sensors
    if args.simulate {
        info!("Using simulated sensor bus");
        let sim = growbox_gateway::sim::SimulatedBus::greenhouse();
        let bus = MuxedBus::from_config(sim, &bus_config);
        let stats = start_climate(
            bus,
            &bus_config,
            climate_config,
            &store,
            &live,
            shutdown_rx.clone(),
            &mut tasks,
        )
        .await?;
        acquisition.push((DeviceClass::Climate, stats));
    } else {
        #[cfg(feature = "hardware")]
        {
            let bus = growbox_gateway::open_linux(&bus_config)?;
            let stats = start_climate(
                bus,
                &bus_config,
                climate_config,
                &store,
                &live,
                shutdown_rx.clone(),
                &mut tasks,
            )
            .await?;
            acquisition.push((DeviceClass::Climate, stats));
        }
        #[cfg(not(feature = "hardware"))]
        return Err(ConfigError::invalid(
            "simulate",
            "built without the hardware feature; pass --simulate",
        )
        .into());
    }

    // Power meters
    let power_meters: Vec<SensorId> = meters.iter().map(|m| SensorId::new(m.name.clone())).collect();
    if !meters.is_empty() {
        let adapter = ShellyAdapter::new(meters, power_config.read_timeout)?;
        let mut scheduler = Scheduler::new(
            adapter,
            power_config,
            Arc::clone(&store),
            Arc::clone(&live),
        );
        scheduler.scan().await?;
        acquisition.push((DeviceClass::Power, scheduler.stats()));
        let shutdown = shutdown_rx.clone();
        tasks.push((
            "power acquisition",
            tokio::spawn(async move {
                if let Err(e) = scheduler.run(shutdown).await {
                    error!("Power acquisition stopped: {}", e);
                }
            }),
        ));
    }

    // Video relay
    let relay_state = match relay_config {
        Some(config) => {
            let relay = Relay::new(config);
            let state = relay.state();
            tasks.push(("video relay", tokio::spawn(relay.run(shutdown_rx.clone()))));
            Some(state)
        }
        None => {
            info!("No RTSP URL configured, video relay disabled");
            None
        }
    };

    let state = Arc::new(AppState {
        power_meters,
        acquisition,
        relay: relay_state,
        hls_dir: args.hls_dir.clone(),
        ..AppState::new(Arc::clone(&store), live, HistoryEngine::new(history_config))
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down");
            let _ = signal_tx.send(true);
        })
        .await;

    // Stop the loops even when the server failed on its own
    let _ = shutdown_tx.send(true);
    for (name, handle) in tasks {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task failed: {}", name, e),
            Err(_) => warn!("{} did not stop in time", name),
        }
    }

    served?;
    info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Growbox Dashboard v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["growbox-dashboard"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.port, 5000);
        assert_eq!(args.bus_config().unwrap().mux_address, Some(0x70));
        assert_eq!(args.channels, vec![0, 1]);
        assert_eq!(args.addresses, vec![0x76, 0x77]);

        let store = args.store_config();
        assert_eq!(store.retention, Duration::from_secs(40 * 86_400));
        assert_eq!(store.prune_interval, Duration::from_secs(3600));
        assert!(store.validate().is_ok());
        assert!(args.bus_config().unwrap().validate().is_ok());
        assert_eq!(args.climate_config().period, Duration::from_secs(60));
        assert_eq!(args.power_config().period, Duration::from_secs(30));
        assert!(args.relay_config().is_none());
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!(parse_address("0x76"), Ok(0x76));
        assert_eq!(parse_address("119"), Ok(0x77));
        assert!(parse_address("0xZZ").is_err());
        assert_eq!(parse_mux_address("none"), Ok(None));
        assert_eq!(parse_mux_address("0x71"), Ok(Some(0x71)));
    }

    #[test]
    fn test_direct_bus_and_meters() {
        let args = parse(&[
            "--mux-address",
            "none",
            "--addresses",
            "0x76",
            "--power-meter",
            "lamp=10.0.0.2",
            "--power-meter",
            "10.0.0.3#1",
        ]);
        let bus = args.bus_config().unwrap();
        assert_eq!(bus.mux_address, None);
        assert_eq!(bus.scan_channels(), vec![0]);

        let meters = args.meters().unwrap();
        assert_eq!(meters[0].name, "lamp");
        assert_eq!(meters[1].name, "shelly-10.0.0.3");
        assert_eq!(meters[1].switch_id, 1);
    }

    #[test]
    fn test_relay_config_from_args() {
        let args = parse(&[
            "--rtsp-url",
            "rtsp://cam.local/stream1",
            "--hls-dir",
            "/tmp/hls",
        ]);
        let relay = args.relay_config().unwrap();
        assert_eq!(relay.source, "rtsp://cam.local/stream1");
        assert_eq!(relay.playlist_path(), PathBuf::from("/tmp/hls/stream.m3u8"));
        assert!(relay.validate().is_ok());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let args = parse(&["--max-points", "0", "--channels", "9"]);
        assert!(args.history_config().validate().is_err());
        assert!(args.bus_config().unwrap().validate().is_err());

        let bad_mux = parse(&["--mux-address", "0x7g"]);
        assert!(bad_mux.bus_config().is_err());
    }

    #[test]
    fn test_oversized_windows_rejected() {
        let args = parse(&[
            "--retention-days",
            "200000000",
            "--history-hours",
            "18446744073709551615",
        ]);
        assert!(args.store_config().validate().is_err());
        assert!(args.history_config().validate().is_err());

        let args = parse(&["--retention-days", "365", "--history-hours", "8784"]);
        assert!(args.store_config().validate().is_ok());
        assert!(args.history_config().validate().is_ok());
    }
}
