//! The scope command protocol: wire encoding, register semantics and fleet-wide operations.

pub mod codec;
pub mod interface;
pub mod state;
pub mod timing;

pub use codec::{Command, ResponseSize};
pub use interface::Interface;
pub use state::{RunState, TriggerMode};
pub use timing::TimingRegisters;
