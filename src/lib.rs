//! # vscope Core Library
//!
//! This crate controls a fleet of identical scope devices over serial links and treats them
//! as one instrument. The command-line frontend (`main.rs`) is a thin layer over it.
//!
//! ## Crate Structure
//!
//! - **`config`**: Loads the flat settings file with `figment`. See `config::Settings`.
//! - **`data`**: Sample arrays, the on-disk snapshot store and the live frame history.
//! - **`error`**: The `VscopeError` enum used across the crate, plus per-device `DeviceError`.
//! - **`hardware`**: Serial link traits, the `Device` wrapper around one scope, the
//!   `DeviceFleet` that discovers and drives all of them, and a protocol-level simulator.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`monitor`**: Supervised background pollers for run state and live frames.
//! - **`protocol`**: Command encoding, timing conversion and the fleet-wide `Interface`.
//!
//! ## Data flow
//!
//! ```text
//! caller -> Interface (encode) -> DeviceFleet::send (lock, fan out, collect)
//!        -> Interface (decode, check consistency) -> caller or SnapshotStore
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod monitor;
pub mod protocol;

pub use error::{AppResult, VscopeError};
