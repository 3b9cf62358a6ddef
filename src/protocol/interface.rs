//! Fleet-wide protocol operations.
//!
//! Every operation encodes one [`Command`], sends it to the whole fleet and folds the
//! per-device responses into a single answer. Getters return `None` when the fleet is empty or
//! the devices disagree; setters return `false` when the fleet is empty or any device refuses.
//! Transport problems are errors: see [`DeviceFleet::send`].

use crate::config::{Settings, DEFAULT_POLLING_RATE_HZ};
use crate::data::array::ChannelData;
use crate::data::frame_history::Frame;
use crate::data::snapshot::{CaptureTiming, SnapshotId, SnapshotStore};
use crate::error::{AppResult, VscopeError};
use crate::hardware::fleet::{DeviceFleet, FleetLayout, FleetResponse, LockPolicy, RefreshReport};
use crate::protocol::codec::{decode_f32, decode_f32s, decode_timing, is_ack, Command};
use crate::protocol::state::{RunState, TriggerMode, RT_BUFFER_LEN, TRG_MODE};
use crate::protocol::timing::TimingRegisters;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Largest difference between devices for a register value to count as shared.
pub const REGISTER_TOLERANCE: f32 = 1e-6;

/// Protocol operations over a shared fleet.
///
/// Cheap to clone; clones share the fleet and may carry a different [`LockPolicy`].
#[derive(Debug, Clone)]
pub struct Interface {
    fleet: Arc<DeviceFleet>,
    polling_rate: f64,
    policy: LockPolicy,
}

impl Interface {
    /// Operations at `polling_rate` Hz, waiting for the fleet lock. A non-positive or
    /// non-finite rate falls back to the default.
    pub fn new(fleet: Arc<DeviceFleet>, polling_rate: f64) -> Self {
        let polling_rate = if polling_rate.is_finite() && polling_rate > 0.0 {
            polling_rate
        } else {
            DEFAULT_POLLING_RATE_HZ
        };
        Self {
            fleet,
            polling_rate,
            policy: LockPolicy::Wait,
        }
    }

    /// Operations using the configured polling rate.
    pub fn from_settings(fleet: Arc<DeviceFleet>, settings: &Settings) -> Self {
        Self::new(fleet, settings.polling_rate())
    }

    /// A handle on the same fleet with another lock policy.
    pub fn with_lock_policy(&self, policy: LockPolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    /// The underlying fleet.
    pub fn fleet(&self) -> &Arc<DeviceFleet> {
        &self.fleet
    }

    /// Onboard sample rate used for timing conversion.
    pub fn polling_rate(&self) -> f64 {
        self.polling_rate
    }

    /// Rediscover devices. Runs on the blocking pool.
    pub async fn refresh(&self, settings: &Settings) -> AppResult<RefreshReport> {
        let fleet = Arc::clone(&self.fleet);
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || fleet.refresh(&settings))
            .await
            .map_err(|e| VscopeError::Worker(e.to_string()))?
    }

    async fn broadcast(&self, command: Command) -> AppResult<Option<FleetResponse>> {
        match self
            .fleet
            .send(&command.encode(), command.response_size(), self.policy)
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(VscopeError::NoDevices) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn acknowledged(&self, command: Command) -> AppResult<bool> {
        let Some(response) = self.broadcast(command).await? else {
            return Ok(false);
        };
        let refused: Vec<&str> = response
            .responses
            .iter()
            .filter(|(_, bytes)| !is_ack(bytes))
            .map(|(id, _)| id.as_str())
            .collect();
        if !refused.is_empty() {
            warn!(?command, devices = ?refused, "Command refused");
        }
        Ok(refused.is_empty())
    }

    async fn layout(&self) -> AppResult<Option<FleetLayout>> {
        self.fleet.command_layout(self.policy).await
    }

    /// Whether any device is connected. Honours the lock policy like every command.
    pub async fn has_devices(&self) -> AppResult<bool> {
        Ok(self.fleet.device_count(self.policy).await? > 0)
    }

    /// `(acquisition, pretrigger)` in seconds, if every device reports the same registers.
    pub async fn get_timing(&self) -> AppResult<Option<(f64, f64)>> {
        let Some(response) = self.broadcast(Command::GetTiming).await? else {
            return Ok(None);
        };
        let registers = consistent(response.responses.values().map(|raw| decode_timing(raw)));
        Ok(registers.map(|(divider, pretrigger)| {
            TimingRegisters {
                divider,
                pretrigger,
            }
            .to_seconds(self.polling_rate, response.layout.buffer_length)
        }))
    }

    /// Program the acquisition window, quantized to the nearest register values.
    #[instrument(skip(self))]
    pub async fn set_timing(&self, acquisition_s: f64, pretrigger_s: f64) -> AppResult<bool> {
        let Some(layout) = self.layout().await? else {
            return Ok(false);
        };
        let registers = TimingRegisters::from_seconds(
            acquisition_s,
            pretrigger_s,
            self.polling_rate,
            layout.buffer_length,
        );
        debug!(
            divider = registers.divider,
            pretrigger = registers.pretrigger,
            "Timing registers"
        );
        self.acknowledged(Command::SetTiming {
            divider: registers.divider,
            pretrigger: registers.pretrigger,
        })
        .await
    }

    /// Set the timing, then read back what the devices actually hold.
    ///
    /// `None` if the devices refused the new timing or disagree afterwards.
    pub async fn apply_timing(
        &self,
        acquisition_s: f64,
        pretrigger_s: f64,
    ) -> AppResult<Option<(f64, f64)>> {
        if !self.set_timing(acquisition_s, pretrigger_s).await? {
            return Ok(None);
        }
        self.get_timing().await
    }

    /// Raw state byte, if every device reports the same one.
    pub async fn get_state(&self) -> AppResult<Option<u8>> {
        let Some(response) = self.broadcast(Command::GetState).await? else {
            return Ok(None);
        };
        let state = consistent(
            response
                .responses
                .values()
                .map(|raw| raw.first().copied()),
        );
        Ok(state)
    }

    /// Decoded run state, if every device reports the same known state.
    pub async fn get_run_state(&self) -> AppResult<Option<RunState>> {
        Ok(self.get_state().await?.and_then(RunState::from_byte))
    }

    /// Request a raw state byte. Firmware refuses values of 3 and above.
    pub async fn set_state(&self, state: u8) -> AppResult<bool> {
        self.acknowledged(Command::SetState(state)).await
    }

    /// Request a run state; on refusal, try to halt every device.
    ///
    /// States the firmware never accepts are refused without sending anything.
    pub async fn change_state(&self, state: RunState) -> AppResult<bool> {
        if !state.is_requestable() {
            warn!(%state, "State cannot be requested");
            return Ok(false);
        }
        let accepted = match self.set_state(state as u8).await {
            Ok(accepted) => accepted,
            Err(e) if e.can_recover() => {
                warn!(error = %e, "State change failed");
                false
            }
            Err(e) => return Err(e),
        };
        if accepted {
            info!(%state, "State changed");
            return Ok(true);
        }

        warn!(%state, "State change refused, halting devices");
        match self.set_state(RunState::Halted as u8).await {
            Ok(true) => info!("Emergency stop succeeded"),
            Ok(false) => warn!("Emergency stop refused"),
            Err(e) => warn!(error = %e, "Emergency stop failed"),
        }
        Ok(false)
    }

    /// Value of a real-time register, if every device agrees within [`REGISTER_TOLERANCE`].
    pub async fn get_buff(&self, index: u32) -> AppResult<Option<f32>> {
        let Some(response) = self.broadcast(Command::GetRegister(index)).await? else {
            return Ok(None);
        };
        let values: Option<Vec<f32>> = response
            .responses
            .values()
            .map(|raw| decode_f32(raw))
            .collect();
        let Some(values) = values else {
            return Ok(None);
        };
        let Some(&first) = values.first() else {
            return Ok(None);
        };
        let shared = values
            .iter()
            .all(|value| (value - first).abs() < REGISTER_TOLERANCE);
        Ok(shared.then_some(first))
    }

    /// Write a real-time register on every device.
    pub async fn set_buff(&self, index: u32, value: f32) -> AppResult<bool> {
        self.acknowledged(Command::SetRegister { index, value }).await
    }

    /// Write a register, then read it back. `None` if the write was refused.
    pub async fn write_register(&self, index: u32, value: f32) -> AppResult<Option<f32>> {
        if !self.set_buff(index, value).await? {
            return Ok(None);
        }
        self.get_buff(index).await
    }

    /// Every real-time register, `None` where the devices disagree.
    pub async fn read_registers(&self) -> AppResult<Vec<Option<f32>>> {
        let mut values = Vec::with_capacity(RT_BUFFER_LEN);
        for index in 0..RT_BUFFER_LEN as u32 {
            values.push(self.get_buff(index).await?);
        }
        Ok(values)
    }

    /// Current trigger edge.
    pub async fn trigger_mode(&self) -> AppResult<Option<TriggerMode>> {
        Ok(self
            .get_buff(TRG_MODE)
            .await?
            .and_then(TriggerMode::from_register))
    }

    /// Select the trigger edge.
    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> AppResult<bool> {
        self.set_buff(TRG_MODE, mode.as_register()).await
    }

    /// Latest sample of every channel, per device. Empty when no device is connected.
    pub async fn get_frame(&self) -> AppResult<Frame> {
        let Some(response) = self.broadcast(Command::GetFrame).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(response
            .responses
            .into_iter()
            .map(|(id, raw)| (id, decode_f32s(&raw)))
            .collect())
    }

    /// Download every device's capture buffer into a new snapshot and persist it.
    ///
    /// Either every device's data is stored or the snapshot is discarded.
    #[instrument(skip(self, store, timing))]
    pub async fn get_snapshot(
        &self,
        store: &mut SnapshotStore,
        description: &str,
        timing: Option<CaptureTiming>,
    ) -> AppResult<SnapshotId> {
        let layout = self.layout().await?.ok_or(VscopeError::NoDevices)?;
        let uid = store.create(
            description,
            usize::from(layout.channels),
            usize::from(layout.buffer_length),
            timing,
            layout.channel_labels.clone(),
        );

        match self.fill_snapshot(store, uid).await {
            Ok(devices) => {
                info!(%uid, devices, "Snapshot captured");
                Ok(uid)
            }
            Err(e) => {
                warn!(%uid, error = %e, "Snapshot capture failed, discarding");
                store.discard(uid);
                Err(e)
            }
        }
    }

    async fn fill_snapshot(&self, store: &mut SnapshotStore, uid: SnapshotId) -> AppResult<usize> {
        let response = self
            .broadcast(Command::Download)
            .await?
            .ok_or(VscopeError::NoDevices)?;
        let snapshot = store
            .get_mut(uid)
            .ok_or_else(|| VscopeError::UnknownSnapshot(uid.to_string()))?;

        let samples = usize::from(response.layout.buffer_length);
        let channels = usize::from(response.layout.channels);
        for (device_id, raw) in &response.responses {
            let data = ChannelData::from_interleaved(&decode_f32s(raw), samples, channels)?;
            snapshot.set_data(device_id, data)?;
        }
        snapshot.cache()?;
        Ok(response.responses.len())
    }
}

/// The shared value, if every item decoded and all are equal.
fn consistent<T: PartialEq>(mut values: impl Iterator<Item = Option<T>>) -> Option<T> {
    let first = values.next()??;
    for value in values {
        if value.as_ref() != Some(&first) {
            return None;
        }
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockScanner, SIM_PID, SIM_VID};
    use tracing_test::traced_test;

    #[test]
    fn consistency_requires_every_value() {
        assert_eq!(consistent([Some(1), Some(1)].into_iter()), Some(1));
        assert_eq!(consistent([Some(1), Some(2)].into_iter()), None);
        assert_eq!(consistent([Some(1), None].into_iter()), None);
        assert_eq!(consistent(std::iter::empty::<Option<u8>>()), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn refused_commands_are_logged() {
        let settings = Settings {
            usb_vid: SIM_VID.to_string(),
            usb_pid: SIM_PID.to_string(),
            ..Settings::default()
        };
        let fleet = Arc::new(DeviceFleet::new(Arc::new(MockScanner::with_scopes(1, 2, 8))));
        let interface = Interface::from_settings(fleet, &settings);
        interface.refresh(&settings).await.unwrap();

        assert!(!interface.set_buff(RT_BUFFER_LEN as u32, 1.0).await.unwrap());
        assert!(logs_contain("Command refused"));
        assert!(logs_contain("sim0"));
    }
}
