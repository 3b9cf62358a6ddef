//! Supervised Pollers
//!
//! Background tasks that sample the fleet periodically, for live displays:
//! - the state poller reads the run state every 50 ms
//! - the frame poller reads one frame every 100 ms and appends it to a [`FrameHistory`]
//!
//! Both publish [`MonitorEvent`]s on a broadcast channel and use a bounded lock wait, so an
//! interactive command holding the fleet makes them skip a tick instead of queueing up.
//! Each poller is owned by a [`Poller`] handle: dropping the handle without calling
//! [`Poller::stop`] aborts the task.
//!
//! ```rust,ignore
//! let monitor = Monitor::new(interface);
//! let mut events = monitor.subscribe();
//! let state = monitor.spawn_state_poller();
//! while let Ok(event) = events.recv().await { /* ... */ }
//! state.stop().await;
//! ```

use crate::data::frame_history::{Frame, FrameHistory};
use crate::error::VscopeError;
use crate::hardware::fleet::LockPolicy;
use crate::protocol::interface::Interface;
use crate::protocol::state::RunState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Period of the state poller.
pub const STATE_PERIOD: Duration = Duration::from_millis(50);
/// Period of the frame poller.
pub const FRAME_PERIOD: Duration = Duration::from_millis(100);
/// How long a poller waits for the fleet lock before skipping a tick.
pub const POLL_LOCK_TIMEOUT: Duration = Duration::from_millis(20);

const EVENT_CAPACITY: usize = 256;

/// Something a poller observed.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Shared run state; `None` when devices disagree or report an unknown state.
    State(Option<RunState>),
    /// One frame of every device.
    Frame {
        /// Time the frame was read
        timestamp: DateTime<Utc>,
        /// Samples per device
        frame: Frame,
    },
    /// A poll failed.
    Error(String),
}

/// Handle on one running poller.
#[derive(Debug)]
pub struct Poller {
    name: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Signal the task to finish its current tick and wait for it.
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!(poller = self.name, error = %e, "Poller task ended abnormally");
            }
        }
        debug!(poller = self.name, "Poller stopped");
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Spawns pollers on a shared interface and fans their results out.
#[derive(Debug, Clone)]
pub struct Monitor {
    interface: Interface,
    events: broadcast::Sender<MonitorEvent>,
    history: Arc<RwLock<FrameHistory>>,
}

impl Monitor {
    /// A monitor over `interface`; pollers use a bounded lock wait regardless of its policy.
    pub fn new(interface: Interface) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            interface: interface.with_lock_policy(LockPolicy::Bounded(POLL_LOCK_TIMEOUT)),
            events,
            history: Arc::new(RwLock::new(FrameHistory::default())),
        }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Frames collected by the frame poller.
    pub fn history(&self) -> Arc<RwLock<FrameHistory>> {
        Arc::clone(&self.history)
    }

    /// Refill the history with NaN frames for the current fleet.
    pub async fn reset_history(&self) {
        let identifiers = self.interface.fleet().identifiers().await;
        let channels = self
            .interface
            .fleet()
            .layout()
            .await
            .map_or(0, |layout| usize::from(layout.channels));
        self.history.write().await.reset(&identifiers, channels);
    }

    /// Start sampling the run state.
    pub fn spawn_state_poller(&self) -> Poller {
        let interface = self.interface.clone();
        let events = self.events.clone();
        self.spawn("state", STATE_PERIOD, move || {
            let interface = interface.clone();
            let events = events.clone();
            async move {
                if !interface.has_devices().await.unwrap_or(false) {
                    return;
                }
                let event = match interface.get_run_state().await {
                    Ok(state) => MonitorEvent::State(state),
                    Err(VscopeError::Busy) => return,
                    Err(e) => MonitorEvent::Error(e.to_string()),
                };
                let _ = events.send(event);
            }
        })
    }

    /// Start sampling frames into the history.
    pub fn spawn_frame_poller(&self) -> Poller {
        let interface = self.interface.clone();
        let events = self.events.clone();
        let history = Arc::clone(&self.history);
        self.spawn("frame", FRAME_PERIOD, move || {
            let interface = interface.clone();
            let events = events.clone();
            let history = Arc::clone(&history);
            async move {
                if !interface.has_devices().await.unwrap_or(false) {
                    return;
                }
                match interface.get_frame().await {
                    Ok(frame) if frame.is_empty() => {}
                    Ok(frame) => {
                        let timestamp = Utc::now();
                        history.write().await.push(timestamp, frame.clone());
                        let _ = events.send(MonitorEvent::Frame { timestamp, frame });
                    }
                    Err(VscopeError::Busy) => trace!("Frame poll skipped, fleet busy"),
                    Err(e) => debug!(error = %e, "Frame poll failed"),
                }
            }
        })
    }

    fn spawn<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> Poller
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = &mut shutdown_rx => break,
                }
            }
        });
        debug!(poller = name, ?period, "Poller started");

        Poller {
            name,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::fleet::DeviceFleet;
    use crate::hardware::mock::{MockScanner, SIM_PID, SIM_VID};

    async fn monitor_with(count: usize) -> Monitor {
        let scanner = MockScanner::with_scopes(count, 2, 8);
        let fleet = Arc::new(DeviceFleet::new(Arc::new(scanner)));
        let settings = Settings {
            usb_vid: SIM_VID.to_string(),
            usb_pid: SIM_PID.to_string(),
            ..Settings::default()
        };
        let interface = Interface::from_settings(fleet, &settings);
        interface.refresh(&settings).await.unwrap();
        Monitor::new(interface)
    }

    #[tokio::test]
    async fn state_poller_publishes_halted() {
        let monitor = monitor_with(2).await;
        let mut events = monitor.subscribe();
        let poller = monitor.spawn_state_poller();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MonitorEvent::State(Some(RunState::Halted))));
        poller.stop().await;
    }

    #[tokio::test]
    async fn frame_poller_fills_history() {
        let monitor = monitor_with(1).await;
        monitor.reset_history().await;
        assert_eq!(monitor.history().read().await.len(), 100);

        let mut events = monitor.subscribe();
        let poller = monitor.spawn_frame_poller();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        poller.stop().await;

        let MonitorEvent::Frame { frame, .. } = event else {
            panic!("expected a frame event, got {event:?}");
        };
        assert_eq!(frame["sim0"], vec![0.0, 1.0]);
        let history = monitor.history();
        let history = history.read().await;
        assert_eq!(history.len(), 100);
        assert_eq!(history.latest().unwrap().1["sim0"], vec![0.0, 1.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pollers_skip_ticks_while_a_command_runs() {
        let scanner = MockScanner::with_scopes(1, 2, 8);
        let fleet = Arc::new(DeviceFleet::new(Arc::new(scanner.clone())));
        let settings = Settings {
            usb_vid: SIM_VID.to_string(),
            usb_pid: SIM_PID.to_string(),
            ..Settings::default()
        };
        let interface = Interface::from_settings(fleet, &settings);
        interface.refresh(&settings).await.unwrap();
        scanner
            .faults("/dev/sim0")
            .unwrap()
            .set_latency(Duration::from_millis(600));

        let slow = interface.clone();
        let in_flight = tokio::spawn(async move { slow.get_state().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let monitor = Monitor::new(interface);
        let state = monitor.spawn_state_poller();
        let frames = monitor.spawn_frame_poller();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        state.stop().await;
        frames.stop().await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(in_flight.await.unwrap().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn stop_ends_the_task() {
        let monitor = monitor_with(0).await;
        let poller = monitor.spawn_state_poller();
        assert!(!poller.is_finished());
        poller.stop().await;
    }
}
