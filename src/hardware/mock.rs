//! Simulated Hardware
//!
//! A scope that speaks the wire protocol behind [`SerialLink`], plus a [`MockScanner`] that
//! hands such scopes out as if they were enumerated USB ports. Used by the tests and by the
//! CLI's `--simulate` mode.
//!
//! The simulation follows the firmware: writes are buffered until a full 9-byte frame is
//! available, the frame is processed and its response queued for reading. Reads on an empty
//! queue report [`ErrorKind::TimedOut`], like a real port whose timeout expired.
//!
//! # Example
//!
//! ```rust
//! use vscope::hardware::mock::{MockScanner, ScopeModel};
//!
//! let scanner = MockScanner::new();
//! let model = scanner.add_port("/dev/sim0", ScopeModel::new("left", 4, 128));
//! model.lock().unwrap().registers[0] = 0.5;
//! ```

use crate::config::SerialSettings;
use crate::error::{AppResult, VscopeError};
use crate::hardware::link::{PortInfo, PortScanner, SerialLink};
use crate::protocol::codec::{Handshake, ACK, FRAME_LEN, LABEL_RESPONSE_LEN};
use crate::protocol::state::{RunState, RT_BUFFER_LEN};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// USB vendor id reported by simulated ports.
pub const SIM_VID: u16 = 0x0483;
/// USB product id reported by simulated ports.
pub const SIM_PID: u16 = 0x5740;

/// Firmware state of a simulated scope.
#[derive(Debug, Clone)]
pub struct ScopeModel {
    /// Name sent in the handshake, at most 10 bytes are transmitted
    pub name: String,
    /// Channel count
    pub channels: u16,
    /// Samples per channel
    pub buffer_length: u16,
    /// Per-channel labels
    pub labels: Vec<String>,
    /// Decimation factor
    pub divider: u32,
    /// Pretrigger samples
    pub pretrigger: u32,
    /// Run state byte
    pub state: u8,
    /// Real-time registers
    pub registers: [f32; RT_BUFFER_LEN],
    /// Latest sample per channel
    pub frame: Vec<f32>,
    /// Capture buffer, `buffer_length` rows of `channels` samples
    pub buffer: Vec<Vec<f32>>,
}

impl ScopeModel {
    /// A halted scope whose buffer holds one sine period per channel, phase shifted by channel.
    pub fn new(name: &str, channels: u16, buffer_length: u16) -> Self {
        let buffer = (0..buffer_length)
            .map(|sample| {
                (0..channels)
                    .map(|channel| {
                        let phase = f32::from(sample) / f32::from(buffer_length.max(1));
                        (std::f32::consts::TAU * phase + f32::from(channel)).sin()
                    })
                    .collect()
            })
            .collect();

        Self {
            name: name.to_string(),
            channels,
            buffer_length,
            labels: (0..channels).map(|channel| format!("ch{channel}")).collect(),
            divider: 1,
            pretrigger: 0,
            state: RunState::Halted as u8,
            registers: [0.0; RT_BUFFER_LEN],
            frame: (0..channels).map(f32::from).collect(),
            buffer,
        }
    }

    /// Process one command frame and return the response bytes.
    pub fn process(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame.len() < FRAME_LEN {
            return Vec::new();
        }
        let mut out = BytesMut::new();
        let u32_at = |index: usize| (&frame[index..index + 4]).get_u32_le();

        match frame[0] {
            b'h' => {
                let handshake = Handshake {
                    channels: self.channels,
                    buffer_length: self.buffer_length,
                    name: self.name.clone(),
                };
                out.put_slice(&handshake.encode());
            }
            b't' => {
                out.put_u32_le(self.divider);
                out.put_u32_le(self.pretrigger);
            }
            b'T' => {
                self.divider = u32_at(1);
                self.pretrigger = u32_at(5);
                out.put_u8(ACK);
            }
            b's' => out.put_u8(self.state),
            b'S' => {
                if frame[8] < RunState::Misconfigured as u8 {
                    self.state = frame[8];
                    out.put_u8(ACK);
                } else {
                    out.put_u8(1);
                }
            }
            b'b' => {
                let index = u32_at(5) as usize;
                out.put_f32_le(self.registers.get(index).copied().unwrap_or(0.0));
            }
            b'B' => {
                let index = u32_at(1) as usize;
                match self.registers.get_mut(index) {
                    Some(register) => {
                        *register = f32::from_bits(u32_at(5));
                        out.put_u8(ACK);
                    }
                    None => out.put_u8(1),
                }
            }
            b'f' => {
                for value in &self.frame {
                    out.put_f32_le(*value);
                }
            }
            b'l' => {
                if let Some(label) = self.labels.get(u32_at(5) as usize) {
                    let bytes = label.as_bytes();
                    let len = bytes.len().min(LABEL_RESPONSE_LEN);
                    out.put_slice(&bytes[..len]);
                    if len < LABEL_RESPONSE_LEN {
                        out.put_u8(0);
                    }
                }
            }
            b'd' => {
                for row in &self.buffer {
                    for value in row {
                        out.put_f32_le(*value);
                    }
                }
            }
            _ => {}
        }
        out.to_vec()
    }
}

/// Runtime fault injection shared between a test and its simulated scope.
#[derive(Debug, Default)]
pub struct Faults {
    silent: AtomicBool,
    latency_ms: AtomicU64,
}

impl Faults {
    /// Drop every command without answering.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Delay every answer.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    fn is_silent(&self) -> bool {
        self.silent.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
    }
}

/// Shared handle to a simulated scope's firmware state.
pub type SharedModel = Arc<Mutex<ScopeModel>>;

/// A simulated scope on the other end of a serial line.
#[derive(Debug)]
pub struct SimulatedScope {
    model: SharedModel,
    faults: Arc<Faults>,
    incoming: Vec<u8>,
    pending: VecDeque<u8>,
}

impl SimulatedScope {
    /// A line connected to a fresh scope.
    pub fn new(model: ScopeModel) -> Self {
        Self::attach(Arc::new(Mutex::new(model)), Arc::new(Faults::default()))
    }

    /// A line connected to an existing scope.
    pub fn attach(model: SharedModel, faults: Arc<Faults>) -> Self {
        Self {
            model,
            faults,
            incoming: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Firmware state of the connected scope.
    pub fn model(&self) -> SharedModel {
        Arc::clone(&self.model)
    }

    /// Fault switches of this line.
    pub fn faults(&self) -> Arc<Faults> {
        Arc::clone(&self.faults)
    }
}

impl Read for SimulatedScope {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "simulated read timeout"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedScope {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.incoming.extend_from_slice(buf);
        while self.incoming.len() >= FRAME_LEN {
            let frame: Vec<u8> = self.incoming.drain(..FRAME_LEN).collect();
            if self.faults.is_silent() {
                continue;
            }
            let latency = self.faults.latency();
            if !latency.is_zero() {
                std::thread::sleep(latency);
            }
            let response = self
                .model
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .process(&frame);
            self.pending.extend(response);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimulatedScope {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.incoming.clear();
        self.pending.clear();
        Ok(())
    }
}

#[derive(Debug)]
struct SimulatedPort {
    info: PortInfo,
    model: SharedModel,
    faults: Arc<Faults>,
    fail_open: bool,
    opens: usize,
}

/// A set of simulated ports that can be plugged and unplugged at runtime.
#[derive(Debug, Default, Clone)]
pub struct MockScanner {
    ports: Arc<Mutex<BTreeMap<String, SimulatedPort>>>,
}

impl MockScanner {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with `count` identical scopes named `sim0`, `sim1`, …
    pub fn with_scopes(count: usize, channels: u16, buffer_length: u16) -> Self {
        let scanner = Self::new();
        for index in 0..count {
            scanner.add_port(
                &format!("/dev/sim{index}"),
                ScopeModel::new(&format!("sim{index}"), channels, buffer_length),
            );
        }
        scanner
    }

    fn ports(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SimulatedPort>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug in a scope with the simulator's USB ids.
    pub fn add_port(&self, path: &str, model: ScopeModel) -> SharedModel {
        self.add_usb_port(path, SIM_VID, SIM_PID, "VScope simulator", model)
    }

    /// Plug in a scope with explicit USB identity.
    pub fn add_usb_port(
        &self,
        path: &str,
        vid: u16,
        pid: u16,
        description: &str,
        model: ScopeModel,
    ) -> SharedModel {
        let model = Arc::new(Mutex::new(model));
        self.ports().insert(
            path.to_string(),
            SimulatedPort {
                info: PortInfo {
                    path: path.to_string(),
                    vid: Some(vid),
                    pid: Some(pid),
                    description: description.to_string(),
                    serial_number: None,
                },
                model: Arc::clone(&model),
                faults: Arc::new(Faults::default()),
                fail_open: false,
                opens: 0,
            },
        );
        model
    }

    /// Unplug a port. Links already open keep talking to the orphaned model.
    pub fn remove_port(&self, path: &str) {
        self.ports().remove(path);
    }

    /// Fault switches shared by every link opened on `path`.
    pub fn faults(&self, path: &str) -> Option<Arc<Faults>> {
        self.ports().get(path).map(|port| Arc::clone(&port.faults))
    }

    /// Make future opens of `path` fail.
    pub fn set_fail_open(&self, path: &str, fail: bool) {
        if let Some(port) = self.ports().get_mut(path) {
            port.fail_open = fail;
        }
    }

    /// How many times `path` was opened.
    pub fn open_count(&self, path: &str) -> usize {
        self.ports().get(path).map_or(0, |port| port.opens)
    }
}

impl PortScanner for MockScanner {
    fn available_ports(&self) -> AppResult<Vec<PortInfo>> {
        Ok(self.ports().values().map(|port| port.info.clone()).collect())
    }

    fn open(&self, path: &str, _settings: &SerialSettings) -> AppResult<Box<dyn SerialLink>> {
        let mut ports = self.ports();
        let port = ports.get_mut(path).ok_or_else(|| {
            VscopeError::Io(io::Error::new(ErrorKind::NotFound, format!("no such port {path}")))
        })?;
        if port.fail_open {
            return Err(VscopeError::Io(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("cannot open {path}"),
            )));
        }
        port.opens += 1;
        Ok(Box::new(SimulatedScope::attach(
            Arc::clone(&port.model),
            Arc::clone(&port.faults),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode_f32s, Command};

    fn exchange(scope: &mut SimulatedScope, command: Command) -> Vec<u8> {
        scope.write_all(&command.encode()).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = scope.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn partial_frames_wait_for_completion() {
        let mut scope = SimulatedScope::new(ScopeModel::new("a", 2, 4));
        scope.write_all(b"s0000").unwrap();
        assert!(scope.read(&mut [0u8; 1]).is_err());
        scope.write_all(b"0000").unwrap();
        let mut byte = [9u8; 1];
        assert_eq!(scope.read(&mut byte).unwrap(), 1);
        assert_eq!(byte[0], RunState::Halted as u8);
    }

    #[test]
    fn rejects_misconfigured_state_requests() {
        let mut scope = SimulatedScope::new(ScopeModel::new("a", 2, 4));
        assert_eq!(exchange(&mut scope, Command::SetState(1)), vec![ACK]);
        assert_eq!(exchange(&mut scope, Command::SetState(3)), vec![1]);
        assert_eq!(exchange(&mut scope, Command::GetState), vec![1]);
    }

    #[test]
    fn labels_are_nul_terminated_and_unpadded() {
        let mut scope = SimulatedScope::new(ScopeModel::new("a", 2, 4));
        assert_eq!(exchange(&mut scope, Command::GetLabel(1)), b"ch1\0".to_vec());
        assert!(exchange(&mut scope, Command::GetLabel(7)).is_empty());
    }

    #[test]
    fn download_is_row_major_by_sample() {
        let mut scope = SimulatedScope::new(ScopeModel::new("a", 2, 3));
        let model = scope.model();
        model.lock().unwrap().buffer = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let values = decode_f32s(&exchange(&mut scope, Command::Download));
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn out_of_range_register_write_is_rejected() {
        let mut scope = SimulatedScope::new(ScopeModel::new("a", 1, 1));
        let response = exchange(
            &mut scope,
            Command::SetRegister {
                index: RT_BUFFER_LEN as u32,
                value: 1.0,
            },
        );
        assert_eq!(response, vec![1]);
    }

    #[test]
    fn scanner_counts_opens_and_fails_on_request() {
        let scanner = MockScanner::with_scopes(1, 2, 4);
        let settings = SerialSettings::default();
        assert!(scanner.open("/dev/sim0", &settings).is_ok());
        assert_eq!(scanner.open_count("/dev/sim0"), 1);

        scanner.set_fail_open("/dev/sim0", true);
        assert!(scanner.open("/dev/sim0", &settings).is_err());
        assert!(scanner.open("/dev/missing", &settings).is_err());
        assert_eq!(scanner.available_ports().unwrap().len(), 1);
    }
}
