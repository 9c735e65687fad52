use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::{Mutex, Notify};

use tankalarm::api;
use tankalarm::command::{CommandKind, RelaySet, RelayState};
use tankalarm::config::{DeviceConfig, NodeSettings};
use tankalarm::fleet::{run_loop, Coordinator, Device, TankSensor, Viewer};
use tankalarm::queue::MessageQueue;
use tankalarm::relay::notecard::NotecardHttpRelay;
use tankalarm::relay::Relay;
use tankalarm::storage::AtomicStore;
use tankalarm::time::MonotonicUptime;
use tankalarm::watchdog::{SoftWatchdog, Watchdog};
use tankalarm::DeviceId;

#[derive(Parser)]
#[command(name = "tankalarm", about = "TankAlarm fleet nodes and operator commands")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for values in the settings file.
#[derive(Args)]
struct NodeArgs {
    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persisted state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Relay identity of this node
    #[arg(long, global = true)]
    device_id: Option<String>,

    /// Notecard request bridge URL
    #[arg(long, global = true)]
    relay_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a field device
    Device {
        /// JSON file of tank levels in inches, e.g. {"1": 42.5}
        #[arg(long)]
        levels: PathBuf,
    },
    /// Run the coordinator and its HTTP API
    Coordinator {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a viewer that prints each new fleet summary
    Viewer,
    /// Push a device configuration (JSON file) to one device
    PushConfig {
        #[arg(long)]
        target: String,
        file: PathBuf,
    },
    /// Drive a relay output on one device
    SetRelay {
        #[arg(long)]
        target: String,
        #[arg(long)]
        output: u8,
        #[arg(value_enum)]
        state: OutputState,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputState {
    On,
    Off,
}

/// Reads levels from a JSON file on every sample, so an external reader
/// process can own the actual acquisition.
struct FileSensor {
    path: PathBuf,
}

impl TankSensor for FileSensor {
    fn read_level(&mut self, tank: u8) -> Option<f64> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Cannot read levels from {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str::<BTreeMap<u8, f64>>(&raw) {
            Ok(levels) => levels.get(&tank).copied(),
            Err(e) => {
                log::warn!("Malformed levels file {:?}: {}", self.path, e);
                None
            }
        }
    }
}

fn load_settings(args: &NodeArgs) -> Result<NodeSettings> {
    let mut settings = match &args.config {
        Some(path) => NodeSettings::load(path).with_context(|| format!("loading {:?}", path))?,
        None => NodeSettings::default(),
    };
    if let Some(dir) = &args.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(id) = &args.device_id {
        settings.device_id = id.clone();
    }
    if let Some(url) = &args.relay_url {
        settings.relay_url = url.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn open_relay(settings: &NodeSettings) -> Result<Arc<dyn Relay>> {
    let relay = NotecardHttpRelay::new(settings.relay_url.clone(), settings.relay_timeout())?;
    Ok(Arc::new(relay))
}

fn open_store(settings: &NodeSettings) -> Result<AtomicStore> {
    AtomicStore::open(&settings.data_dir).with_context(|| format!("opening {:?}", settings.data_dir))
}

/// Software stand-in for the hardware watchdog: a missed kick ends the
/// process so the supervisor restarts it, and the next boot runs recovery.
fn start_watchdog(settings: &NodeSettings) -> Arc<dyn Watchdog> {
    Arc::new(SoftWatchdog::start(settings.watchdog_timeout(), || {
        log::error!("Control loop stalled, exiting for restart");
        std::process::exit(2);
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_device(settings: NodeSettings, levels: &Path) -> Result<()> {
    let sensor = FileSensor {
        path: levels.to_path_buf(),
    };
    let mut device = Device::boot(
        &settings,
        open_relay(&settings)?,
        open_store(&settings)?,
        Box::new(sensor),
        Arc::new(MonotonicUptime::new()),
        start_watchdog(&settings),
    )
    .await?;
    run_loop(&mut device, Arc::new(Notify::new()), shutdown_signal()).await;
    Ok(())
}

async fn boot_coordinator(settings: &NodeSettings, watchdog: Arc<dyn Watchdog>) -> Result<Coordinator> {
    Ok(Coordinator::boot(
        settings,
        open_relay(settings)?,
        open_store(settings)?,
        Arc::new(MonotonicUptime::new()),
        watchdog,
    )
    .await?)
}

async fn run_coordinator(settings: NodeSettings, port: Option<u16>) -> Result<()> {
    let coordinator = boot_coordinator(&settings, start_watchdog(&settings)).await?;
    let mut shared = Arc::new(Mutex::new(coordinator));
    let wake = Arc::new(Notify::new());
    let stop_api = Arc::new(Notify::new());

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(settings.http_port)));
    let server = {
        let stop_api = Arc::clone(&stop_api);
        tokio::spawn(api::serve(
            Arc::clone(&shared),
            Some(Arc::clone(&wake)),
            addr,
            async move { stop_api.notified().await },
        ))
    };

    run_loop(&mut shared, wake, shutdown_signal()).await;
    stop_api.notify_one();
    server.await.context("API server task")?;
    Ok(())
}

async fn run_viewer(settings: NodeSettings) -> Result<()> {
    let queue = MessageQueue::new(open_relay(&settings)?).with_timeout(settings.relay_timeout());
    let mut viewer = Viewer::new(queue, start_watchdog(&settings));
    run_loop(&mut viewer, Arc::new(Notify::new()), shutdown_signal()).await;
    if let Some(summary) = viewer.latest() {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}

/// Operator commands go through the coordinator's dispatcher so they are
/// tracked for retry. Run them while the coordinator process is stopped.
async fn dispatch(settings: NodeSettings, target: String, kind: CommandKind) -> Result<()> {
    let mut coordinator = boot_coordinator(&settings, Arc::new(tankalarm::watchdog::NoopWatchdog)).await?;
    let target = DeviceId::new(target);
    let id = match kind {
        CommandKind::ConfigPush(config) => coordinator.push_config(target.clone(), config).await?,
        other => coordinator.send_command(target.clone(), other).await?,
    };
    coordinator.shutdown()?;
    println!("{} queued for {}", id, target);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.node)?;

    match cli.command {
        Commands::Device { levels } => run_device(settings, &levels).await,
        Commands::Coordinator { port } => run_coordinator(settings, port).await,
        Commands::Viewer => run_viewer(settings).await,
        Commands::PushConfig { target, file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
            let config: DeviceConfig = serde_json::from_str(&raw).context("parsing device config")?;
            if let Err(e) = config.validate() {
                bail!("refusing to push invalid config: {}", e);
            }
            dispatch(settings, target, CommandKind::ConfigPush(config)).await
        }
        Commands::SetRelay { target, output, state } => {
            let state = match state {
                OutputState::On => RelayState::On,
                OutputState::Off => RelayState::Off,
            };
            dispatch(settings, target, CommandKind::RelaySet(RelaySet { output, state })).await
        }
    }
}
