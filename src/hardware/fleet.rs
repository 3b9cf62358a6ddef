//! The set of connected scopes, driven as one instrument.
//!
//! [`DeviceFleet`] discovers matching ports, keeps every member homogeneous and dispatches each
//! command to all members at once. One async mutex guards the fleet: at most one command is in
//! flight, while the per-device I/O of that command overlaps on the blocking worker pool.
//!
//! Refresh is synchronous and never waits for the lock. If a command is in flight it reports
//! [`VscopeError::Busy`] instead of racing with it.

use crate::config::{SerialSettings, Settings};
use crate::error::{AppResult, VscopeError};
use crate::hardware::device::Device;
use crate::hardware::link::{PortInfo, PortScanner};
use crate::protocol::codec::ResponseSize;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

type SharedDevice = Arc<std::sync::Mutex<Device>>;
type FleetGuard<'a> = tokio::sync::MutexGuard<'a, FleetState>;

fn lock(device: &SharedDevice) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How long a command may wait for the fleet lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    /// Wait until the lock is free.
    #[default]
    Wait,
    /// Give up with [`VscopeError::Busy`] after this long.
    Bounded(Duration),
}

/// Dimensions shared by every member of a validated fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetLayout {
    /// Channels per device
    pub channels: u16,
    /// Samples per channel
    pub buffer_length: u16,
    /// One label per channel
    pub channel_labels: Vec<String>,
}

/// Responses of every device to one command, keyed by device identifier.
#[derive(Debug, Clone)]
pub struct FleetResponse {
    /// Layout of the fleet that answered
    pub layout: FleetLayout,
    /// Raw response bytes per device
    pub responses: BTreeMap<String, Vec<u8>>,
}

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Ports that passed the USB filter
    pub matched_ports: usize,
    /// Identifiers of newly connected devices
    pub added: Vec<String>,
    /// Identifiers of devices that were handshaken again
    pub reconfigured: Vec<String>,
    /// Identifiers of devices that left the fleet
    pub removed: Vec<String>,
}

#[derive(Default)]
struct FleetState {
    devices: BTreeMap<String, SharedDevice>,
    layout: Option<FleetLayout>,
    last_serial: Option<SerialSettings>,
}

/// Owner of all connected devices.
pub struct DeviceFleet {
    scanner: Arc<dyn PortScanner>,
    state: Mutex<FleetState>,
}

impl std::fmt::Debug for DeviceFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFleet").finish_non_exhaustive()
    }
}

impl DeviceFleet {
    /// An empty fleet that discovers ports through `scanner`.
    pub fn new(scanner: Arc<dyn PortScanner>) -> Self {
        Self {
            scanner,
            state: Mutex::new(FleetState::default()),
        }
    }

    /// Bring the fleet in line with the ports currently present.
    ///
    /// Blocks while new or rediscovered devices are handshaken; call it from a blocking
    /// context. On [`VscopeError::ConfigMismatch`] and [`VscopeError::InitializationFailure`]
    /// the devices stay connected but the fleet has no layout, so commands are refused until a
    /// later refresh succeeds.
    #[instrument(skip_all)]
    pub fn refresh(&self, settings: &Settings) -> AppResult<RefreshReport> {
        let mut state = self.state.try_lock().map_err(|_| VscopeError::Busy)?;
        let mut report = RefreshReport::default();

        let serial = settings.serial();
        if state.last_serial.is_some_and(|last| last != serial) {
            info!(?serial, "Serial settings changed, closing all devices");
            report.removed.extend(state.devices.keys().cloned());
            state.devices.clear();
        }
        state.last_serial = Some(serial);
        state.layout = None;

        let filter = settings.usb_filter();
        let matching: Vec<PortInfo> = self
            .scanner
            .available_ports()?
            .into_iter()
            .filter(|port| filter.matches(port.vid, port.pid, &port.description))
            .collect();
        report.matched_ports = matching.len();
        debug!(matched = matching.len(), "Enumerated serial ports");

        let tracked: BTreeMap<String, String> = state
            .devices
            .iter()
            .map(|(id, device)| (lock(device).comport().to_string(), id.clone()))
            .collect();

        for port in &matching {
            match tracked.get(&port.path) {
                Some(id) => reconfigure(&mut state.devices, id, &mut report),
                None => match Device::connect(self.scanner.as_ref(), &port.path, &serial) {
                    Ok(device) => {
                        let id = device.identifier().to_string();
                        if state.devices.contains_key(&id) {
                            warn!(device = %id, port = %port.path, "Duplicate device identifier, keeping the first registered");
                        } else {
                            info!(device = %id, port = %port.path, "Device connected");
                            state.devices.insert(id.clone(), Arc::new(std::sync::Mutex::new(device)));
                            report.added.push(id);
                        }
                    }
                    Err(e) => warn!(port = %port.path, error = %e, "Device initialization failed"),
                },
            }
        }

        let present: BTreeSet<&str> = matching.iter().map(|port| port.path.as_str()).collect();
        let stale: Vec<String> = state
            .devices
            .iter()
            .filter(|(_, device)| !present.contains(lock(device).comport()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            info!(device = %id, "Device disappeared");
            state.devices.remove(&id);
            report.removed.push(id);
        }

        let layout = check_homogeneity(&state.devices)?;

        if matching.len() != state.devices.len() {
            return Err(VscopeError::InitializationFailure {
                matched_ports: matching.len(),
                initialized: state.devices.len(),
            });
        }

        state.layout = layout;
        Ok(report)
    }

    /// Send `message` to every device and collect the responses.
    ///
    /// Devices that fail are removed from the fleet and named in
    /// [`VscopeError::CommunicationFailure`]; the responses of the others are discarded.
    pub async fn send(
        &self,
        message: &[u8],
        size: ResponseSize,
        policy: LockPolicy,
    ) -> AppResult<FleetResponse> {
        let mut state = self.acquire(policy).await?;

        if state.devices.is_empty() {
            return Err(VscopeError::NoDevices);
        }
        let layout = state.layout.clone().ok_or(VscopeError::Unconfigured)?;

        let message: Arc<[u8]> = Arc::from(message);
        let exchanges = state.devices.iter().map(|(id, device)| {
            let id = id.clone();
            let device = Arc::clone(device);
            let message = Arc::clone(&message);
            async move {
                let result = tokio::task::spawn_blocking(move || {
                    let mut device = lock(&device);
                    let expected = size.resolve(device.channels());
                    device.send(&message, expected)
                })
                .await;
                (id, result)
            }
        });

        let mut responses = BTreeMap::new();
        let mut failed = Vec::new();
        for (id, result) in join_all(exchanges).await {
            match result {
                Ok(Ok(response)) => {
                    responses.insert(id, response);
                }
                Ok(Err(e)) => {
                    warn!(device = %id, error = %e, "Device command failed");
                    failed.push(id);
                }
                Err(e) => {
                    error!(device = %id, error = %e, "Device worker did not complete");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            for id in &failed {
                state.devices.remove(id);
            }
            if state.devices.is_empty() {
                state.layout = None;
            }
            return Err(VscopeError::CommunicationFailure { failed });
        }

        Ok(FleetResponse { layout, responses })
    }

    async fn acquire(&self, policy: LockPolicy) -> AppResult<FleetGuard<'_>> {
        match policy {
            LockPolicy::Wait => Ok(self.state.lock().await),
            LockPolicy::Bounded(limit) => tokio::time::timeout(limit, self.state.lock())
                .await
                .map_err(|_| VscopeError::Busy),
        }
    }

    /// Layout commands would run with, taking the lock under `policy`.
    ///
    /// `None` without devices; [`VscopeError::Unconfigured`] when devices are connected but
    /// the last refresh failed.
    pub async fn command_layout(&self, policy: LockPolicy) -> AppResult<Option<FleetLayout>> {
        let state = self.acquire(policy).await?;
        match (&state.layout, state.devices.is_empty()) {
            (_, true) => Ok(None),
            (Some(layout), false) => Ok(Some(layout.clone())),
            (None, false) => Err(VscopeError::Unconfigured),
        }
    }

    /// Number of connected devices, taking the lock under `policy`.
    pub async fn device_count(&self, policy: LockPolicy) -> AppResult<usize> {
        Ok(self.acquire(policy).await?.devices.len())
    }

    /// Layout of the fleet after the last successful refresh.
    pub async fn layout(&self) -> Option<FleetLayout> {
        self.state.lock().await.layout.clone()
    }

    /// Identifiers of the connected devices, in dispatch order.
    pub async fn identifiers(&self) -> Vec<String> {
        self.state.lock().await.devices.keys().cloned().collect()
    }

    /// `(identifier, port)` of every connected device.
    pub async fn ports(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .devices
            .iter()
            .map(|(id, device)| (id.clone(), lock(device).comport().to_string()))
            .collect()
    }

    /// Number of connected devices.
    pub async fn len(&self) -> usize {
        self.state.lock().await.devices.len()
    }

    /// Whether no device is connected.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.devices.is_empty()
    }

    /// Close every device.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        state.devices.clear();
        state.layout = None;
        info!("All devices disconnected");
    }
}

fn reconfigure(
    devices: &mut BTreeMap<String, SharedDevice>,
    id: &str,
    report: &mut RefreshReport,
) {
    let Some(device) = devices.remove(id) else {
        return;
    };

    let outcome = {
        let mut guard = lock(&device);
        guard.configure().map(|()| guard.identifier().to_string())
    };
    match outcome {
        Ok(new_id) if devices.contains_key(&new_id) => {
            warn!(device = %new_id, "Reconfigured device now duplicates another identifier, dropping it");
            report.removed.push(id.to_string());
        }
        Ok(new_id) => {
            if new_id != id {
                info!(old = %id, new = %new_id, "Device identifier changed");
            }
            devices.insert(new_id.clone(), device);
            report.reconfigured.push(new_id);
        }
        Err(e) => {
            warn!(device = %id, error = %e, "Reconfiguration failed, removing device");
            report.removed.push(id.to_string());
        }
    }
}

/// Compare every device against the first one; `None` for an empty fleet.
fn check_homogeneity(devices: &BTreeMap<String, SharedDevice>) -> AppResult<Option<FleetLayout>> {
    let mut members = devices.iter();
    let Some((reference_id, reference)) = members.next() else {
        return Ok(None);
    };
    let layout = {
        let reference = lock(reference);
        FleetLayout {
            channels: reference.channels(),
            buffer_length: reference.buffer_length(),
            channel_labels: reference.channel_labels().to_vec(),
        }
    };

    let divergent: Vec<String> = members
        .filter_map(|(id, device)| {
            let device = lock(device);
            let same = device.channels() == layout.channels
                && device.buffer_length() == layout.buffer_length
                && device.channel_labels() == layout.channel_labels.as_slice();
            (!same).then(|| {
                format!(
                    "{id}: {}ch/{}buf",
                    device.channels(),
                    device.buffer_length()
                )
            })
        })
        .collect();

    if !divergent.is_empty() {
        return Err(VscopeError::ConfigMismatch {
            reference: reference_id.clone(),
            expected_channels: layout.channels,
            expected_buffer_length: layout.buffer_length,
            divergent,
        });
    }
    Ok(Some(layout))
}
