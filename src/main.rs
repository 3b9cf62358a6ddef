//! CLI Entry Point for vscope
//!
//! Drives a fleet of scope devices from the command line:
//! - discovery and status (`scan`, `state`, `timing`, `register`, `frame`)
//! - capture and snapshot management (`capture`, `snapshots`)
//! - live monitoring (`monitor`)
//!
//! # Usage
//!
//! ```bash
//! vscope scan
//! vscope timing set 1.0 0.1
//! vscope state set running
//! vscope capture "motor start, 24 V"
//! vscope snapshots list
//! vscope --simulate 3 monitor --seconds 2
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vscope::config::Settings;
use vscope::data::snapshot::{CaptureTiming, SnapshotId, SnapshotStore};
use vscope::hardware::fleet::{DeviceFleet, RefreshReport};
use vscope::hardware::link::{PortScanner, SystemPorts};
use vscope::hardware::mock::{MockScanner, SIM_PID, SIM_VID};
use vscope::logging::{self, OutputFormat, TracingConfig};
use vscope::monitor::{Monitor, MonitorEvent};
use vscope::protocol::interface::Interface;
use vscope::protocol::state::{register_name, RunState, TriggerMode, RT_BUFFER_LEN};

const SIM_CHANNELS: u16 = 4;
const SIM_BUFFER_LENGTH: u16 = 1000;

#[derive(Parser)]
#[command(name = "vscope")]
#[command(about = "Control a fleet of scope devices over serial links", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/vscope/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use this many simulated devices instead of serial ports
    #[arg(long, global = true, value_name = "N")]
    simulate: Option<usize>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover devices and print the fleet layout
    Scan,

    /// Show the run state, or change it
    State {
        #[command(subcommand)]
        action: Option<StateAction>,
    },

    /// Show the acquisition timing, or change it
    Timing {
        #[command(subcommand)]
        action: Option<TimingAction>,
    },

    /// Read or write real-time registers
    Register {
        #[command(subcommand)]
        action: RegisterAction,
    },

    /// Print one live frame of every device
    Frame,

    /// Download the capture buffers into a new snapshot
    Capture {
        /// Description stored with the snapshot
        description: String,
    },

    /// Manage cached snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Stream run state and frames for a while
    Monitor {
        /// How long to run
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Request a run state
    Set {
        #[arg(value_enum)]
        state: StateArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Halted,
    Running,
    Acquiring,
}

impl From<StateArg> for RunState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Halted => RunState::Halted,
            StateArg::Running => RunState::Running,
            StateArg::Acquiring => RunState::Acquiring,
        }
    }
}

#[derive(Subcommand)]
enum TimingAction {
    /// Set acquisition and pretrigger time in seconds (devices must be halted)
    Set { acquisition: f64, pretrigger: f64 },
}

#[derive(Subcommand)]
enum RegisterAction {
    /// Read one register
    Get { index: u32 },
    /// Write one register and read it back
    Set { index: u32, value: f32 },
    /// Read all registers
    Dump,
    /// Show or set the trigger edge
    Trigger {
        #[arg(value_enum)]
        mode: Option<TriggerArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    Disabled,
    Rising,
    Falling,
    Both,
}

impl From<TriggerArg> for TriggerMode {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Disabled => TriggerMode::Disabled,
            TriggerArg::Rising => TriggerMode::Rising,
            TriggerArg::Falling => TriggerMode::Falling,
            TriggerArg::Both => TriggerMode::Both,
        }
    }
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots, most recent first
    List,
    /// Show one snapshot
    Show { uid: String },
    /// Delete one snapshot
    Delete { uid: String },
    /// Check whether snapshots can be overlaid
    Compare {
        #[arg(required = true, num_args = 2..)]
        uids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load settings")?;

    let format = match cli.log_format {
        LogFormat::Pretty => OutputFormat::Pretty,
        LogFormat::Compact => OutputFormat::Compact,
        LogFormat::Json => OutputFormat::Json,
    };
    let tracing_config = TracingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Snapshots { action } = &cli.command {
        let mut store = open_store(&settings)?;
        return run_snapshots(&mut store, action);
    }

    let scanner: Arc<dyn PortScanner> = match cli.simulate {
        Some(count) => {
            settings.usb_vid = SIM_VID.to_string();
            settings.usb_pid = SIM_PID.to_string();
            Arc::new(MockScanner::with_scopes(count, SIM_CHANNELS, SIM_BUFFER_LENGTH))
        }
        None => Arc::new(SystemPorts),
    };
    settings.validate().context("Invalid settings")?;

    let fleet = Arc::new(DeviceFleet::new(scanner));
    let interface = Interface::from_settings(Arc::clone(&fleet), &settings);
    let report = interface
        .refresh(&settings)
        .await
        .context("Device discovery failed")?;
    info!(
        devices = report.added.len() + report.reconfigured.len(),
        "Fleet ready"
    );

    let result = run_device_command(&cli.command, &interface, &settings, &report).await;
    fleet.disconnect_all().await;
    result
}

fn open_store(settings: &Settings) -> Result<SnapshotStore> {
    let mut store = SnapshotStore::open_default();
    store
        .load_from_cache(settings.cache_gc_days)
        .with_context(|| format!("Failed to read snapshot cache {}", store.root().display()))?;
    Ok(store)
}

async fn run_device_command(
    command: &Commands,
    interface: &Interface,
    settings: &Settings,
    report: &RefreshReport,
) -> Result<()> {
    match command {
        Commands::Scan => scan(interface, report).await,
        Commands::State { action } => match action {
            None => {
                match interface.get_state().await? {
                    Some(byte) => match RunState::from_byte(byte) {
                        Some(state) => println!("{state}"),
                        None => println!("unknown ({byte})"),
                    },
                    None => println!("inconsistent"),
                }
                Ok(())
            }
            Some(StateAction::Set { state }) => {
                let state = RunState::from(*state);
                if !interface.change_state(state).await? {
                    bail!("Devices refused state {state}; halt was requested");
                }
                println!("{state}");
                Ok(())
            }
        },
        Commands::Timing { action } => match action {
            None => {
                match interface.get_timing().await? {
                    Some((acquisition, pretrigger)) => {
                        println!("acquisition: {acquisition:.6} s");
                        println!("pretrigger:  {pretrigger:.6} s");
                    }
                    None => println!("inconsistent"),
                }
                Ok(())
            }
            Some(TimingAction::Set {
                acquisition,
                pretrigger,
            }) => {
                if interface.get_run_state().await? != Some(RunState::Halted) {
                    bail!("Timing can only be changed while the devices are halted");
                }
                match interface.apply_timing(*acquisition, *pretrigger).await? {
                    Some((acquisition, pretrigger)) => {
                        println!("acquisition: {acquisition:.6} s");
                        println!("pretrigger:  {pretrigger:.6} s");
                        Ok(())
                    }
                    None => bail!("Devices refused the timing or disagree after the update"),
                }
            }
        },
        Commands::Register { action } => run_register(interface, action).await,
        Commands::Frame => {
            for (device, values) in interface.get_frame().await? {
                let values: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
                println!("{device}: {}", values.join(" "));
            }
            Ok(())
        }
        Commands::Capture { description } => {
            let mut store = open_store(settings)?;
            let timing = interface
                .get_timing()
                .await?
                .map(|(acquisition_time, pretrigger_time)| CaptureTiming {
                    acquisition_time,
                    pretrigger_time,
                });
            if timing.is_none() {
                warn!("Timing is inconsistent across devices, snapshot will not be comparable");
            }
            let uid = interface
                .get_snapshot(&mut store, description, timing)
                .await
                .context("Capture failed")?;
            println!("{uid}");
            Ok(())
        }
        Commands::Monitor { seconds } => monitor(interface, *seconds).await,
        Commands::Snapshots { .. } => Ok(()),
    }
}

async fn scan(interface: &Interface, report: &RefreshReport) -> Result<()> {
    println!("matched ports: {}", report.matched_ports);
    for id in &report.removed {
        println!("removed: {id}");
    }
    for (id, port) in interface.fleet().ports().await {
        println!("{id} on {port}");
    }
    if let Some(layout) = interface.fleet().layout().await {
        println!(
            "{} channels x {} samples: {}",
            layout.channels,
            layout.buffer_length,
            layout.channel_labels.join(", ")
        );
    }
    Ok(())
}

async fn run_register(interface: &Interface, action: &RegisterAction) -> Result<()> {
    match action {
        RegisterAction::Get { index } => {
            print_register(*index, interface.get_buff(*index).await?);
        }
        RegisterAction::Set { index, value } => {
            if usize::try_from(*index).map_or(true, |i| i >= RT_BUFFER_LEN) {
                bail!("Register index must be below {RT_BUFFER_LEN}");
            }
            match interface.write_register(*index, *value).await? {
                Some(readback) => print_register(*index, Some(readback)),
                None => bail!("Devices refused the register write"),
            }
        }
        RegisterAction::Dump => {
            for (index, value) in interface.read_registers().await?.into_iter().enumerate() {
                print_register(index as u32, value);
            }
        }
        RegisterAction::Trigger { mode: None } => match interface.trigger_mode().await? {
            Some(mode) => println!("{mode:?}"),
            None => println!("inconsistent"),
        },
        RegisterAction::Trigger { mode: Some(mode) } => {
            if !interface.set_trigger_mode((*mode).into()).await? {
                bail!("Devices refused the trigger mode");
            }
        }
    }
    Ok(())
}

fn print_register(index: u32, value: Option<f32>) {
    let name = register_name(index).map(|name| format!(" ({name})")).unwrap_or_default();
    match value {
        Some(value) => println!("{index:2}{name}: {value}"),
        None => println!("{index:2}{name}: inconsistent"),
    }
}

async fn monitor(interface: &Interface, seconds: f64) -> Result<()> {
    let monitor = Monitor::new(interface.clone());
    monitor.reset_history().await;
    let mut events = monitor.subscribe();
    let state_poller = monitor.spawn_state_poller();
    let frame_poller = monitor.spawn_frame_poller();

    let duration = Duration::try_from_secs_f64(seconds).context("Invalid monitor duration")?;
    let deadline = tokio::time::Instant::now() + duration;
    let mut last_state = None;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => break,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(skipped, "Monitor output fell behind");
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Ok(Ok(MonitorEvent::State(state))) => {
                if state != last_state {
                    match state {
                        Some(state) => println!("state: {state}"),
                        None => println!("state: inconsistent"),
                    }
                    last_state = state;
                }
            }
            Ok(Ok(MonitorEvent::Frame { timestamp, frame })) => {
                for (device, values) in frame {
                    let values: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
                    println!("{} {device}: {}", timestamp.format("%H:%M:%S%.3f"), values.join(" "));
                }
            }
            Ok(Ok(MonitorEvent::Error(message))) => warn!(%message, "Poll failed"),
        }
    }

    state_poller.stop().await;
    frame_poller.stop().await;
    let history = monitor.history();
    let history = history.read().await;
    for (device, series) in history.series() {
        for (channel, values) in series.rows().enumerate() {
            let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                continue;
            }
            let mean = finite.iter().sum::<f32>() / finite.len() as f32;
            println!("{device} ch{channel}: mean {mean:.4} over {} frames", finite.len());
        }
    }
    info!(frames = history.len(), "Monitor finished");
    Ok(())
}

fn run_snapshots(store: &mut SnapshotStore, action: &SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::List => {
            for snapshot in store.list() {
                let created = snapshot
                    .uid()
                    .created_at()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let devices = snapshot.device_count().unwrap_or(0);
                println!(
                    "{}  {created}  {}ch/{}  {devices} devices  {}",
                    snapshot.uid(),
                    snapshot.channels(),
                    snapshot.buffer_length(),
                    snapshot.description()
                );
            }
        }
        SnapshotAction::Show { uid } => {
            let uid: SnapshotId = uid.parse()?;
            let snapshot = store
                .get_mut(uid)
                .with_context(|| format!("Unknown snapshot {uid}"))?;
            println!("uid:          {}", snapshot.uid());
            println!("description:  {}", snapshot.description());
            println!(
                "layout:       {} channels x {} samples",
                snapshot.channels(),
                snapshot.buffer_length()
            );
            match snapshot.timing() {
                Some(timing) => println!(
                    "timing:       {} s, pretrigger {} s",
                    timing.acquisition_time, timing.pretrigger_time
                ),
                None => println!("timing:       unknown"),
            }
            println!("labels:       {}", snapshot.channel_labels().join(", "));
            for (device, data) in snapshot.get_data()? {
                let (min, max) = data
                    .rows()
                    .flatten()
                    .filter(|v| v.is_finite())
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(*v), hi.max(*v))
                    });
                println!("{device}: min {min} max {max}");
            }
        }
        SnapshotAction::Delete { uid } => {
            let uid: SnapshotId = uid.parse()?;
            store.remove(uid)?;
            println!("deleted {uid}");
        }
        SnapshotAction::Compare { uids } => {
            let uids = uids
                .iter()
                .map(|uid| uid.parse::<SnapshotId>())
                .collect::<Result<Vec<_>, _>>()?;
            if store.can_be_compared(&uids) {
                println!("comparable");
            } else {
                println!("not comparable");
            }
        }
    }
    Ok(())
}
