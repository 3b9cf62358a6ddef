//! Serial port seam.
//!
//! Devices talk to an open [`SerialLink`]; the fleet discovers and opens links through a
//! [`PortScanner`]. [`SystemPorts`] implements both over the `serialport` crate, and
//! [`crate::hardware::mock`] provides a simulated scope for tests and `--simulate` runs.

use crate::config::{DataBits, Parity, SerialSettings, StopBits};
use crate::error::AppResult;
use serialport::{ClearBuffer, FlowControl, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// An open, byte-oriented serial line.
///
/// Reads honour the timeout set by [`SerialLink::set_timeout`] and report
/// [`io::ErrorKind::TimedOut`] when no byte arrived in time.
pub trait SerialLink: Read + Write + Send {
    /// Set the per-read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop any bytes waiting in the input and output buffers.
    fn discard_buffers(&mut self) -> io::Result<()>;
}

/// Identity of an enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS path of the port, e.g. `/dev/ttyACM0` or `COM3`
    pub path: String,
    /// USB vendor id, if the port is a USB device
    pub vid: Option<u16>,
    /// USB product id, if the port is a USB device
    pub pid: Option<u16>,
    /// Human readable description (USB product string, or the path)
    pub description: String,
    /// USB serial number, if reported
    pub serial_number: Option<String>,
}

/// Enumerates serial ports and opens them.
pub trait PortScanner: Send + Sync {
    /// All serial ports currently present on the system.
    fn available_ports(&self) -> AppResult<Vec<PortInfo>>;

    /// Open `path` with the given line settings.
    fn open(&self, path: &str, settings: &SerialSettings) -> AppResult<Box<dyn SerialLink>>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::from)
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Real serial ports, via the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl SystemPorts {
    /// Timeout applied when a port is first opened; devices adjust it per command.
    const OPEN_TIMEOUT: Duration = Duration::from_millis(20);
}

impl PortScanner for SystemPorts {
    fn available_ports(&self) -> AppResult<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    description: usb
                        .product
                        .clone()
                        .or_else(|| usb.manufacturer.clone())
                        .unwrap_or_else(|| port.port_name.clone()),
                    path: port.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                },
                _ => PortInfo {
                    description: port.port_name.clone(),
                    path: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                },
            })
            .collect())
    }

    fn open(&self, path: &str, settings: &SerialSettings) -> AppResult<Box<dyn SerialLink>> {
        let data_bits = match settings.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let stop_bits = match settings.stop_bits {
            StopBits::Two => serialport::StopBits::Two,
            StopBits::One => serialport::StopBits::One,
            StopBits::OnePointFive => {
                warn!(port = path, "1.5 stop bits unsupported by the host driver, using 1");
                serialport::StopBits::One
            }
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                warn!(port = path, parity = ?settings.parity, "Parity mode unsupported by the host driver, using none");
                serialport::Parity::None
            }
        };

        let port = serialport::new(path, settings.baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None)
            .timeout(Self::OPEN_TIMEOUT)
            .open()?;

        debug!(port = path, baud = settings.baud, "Opened serial port");
        Ok(Box::new(port))
    }
}
