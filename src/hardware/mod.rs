//! Scope hardware: serial links, single devices and the device fleet.

pub mod device;
pub mod fleet;
pub mod link;
pub mod mock;

pub use device::Device;
pub use fleet::{DeviceFleet, FleetLayout, FleetResponse, LockPolicy, RefreshReport};
pub use link::{PortInfo, PortScanner, SerialLink, SystemPorts};
