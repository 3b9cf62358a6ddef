//! Run states and the real-time register map.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of real-time registers.
pub const RT_BUFFER_LEN: usize = 16;

/// Register holding the trigger threshold.
pub const TRG_THRESHOLD: u32 = 0;
/// Register holding the trigger channel index.
pub const TRG_CHANNEL: u32 = 1;
/// Register holding the [`TriggerMode`].
pub const TRG_MODE: u32 = 2;

/// Name of a register with a fixed meaning.
pub fn register_name(index: u32) -> Option<&'static str> {
    match index {
        TRG_THRESHOLD => Some("trigger threshold"),
        TRG_CHANNEL => Some("trigger channel"),
        TRG_MODE => Some("trigger mode"),
        _ => None,
    }
}

/// Acquisition state machine of the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunState {
    /// Not sampling
    Halted = 0,
    /// Sampling into the ring buffer, waiting for a trigger
    Running = 1,
    /// Triggered, filling the post-trigger part of the buffer
    Acquiring = 2,
    /// Timing registers are inconsistent; cannot be requested
    Misconfigured = 3,
}

impl RunState {
    /// Decode a state byte.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Halted),
            1 => Some(Self::Running),
            2 => Some(Self::Acquiring),
            3 => Some(Self::Misconfigured),
            _ => None,
        }
    }

    /// Whether firmware accepts this state as a request.
    pub fn is_requestable(self) -> bool {
        self != Self::Misconfigured
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Halted => "halted",
            Self::Running => "running",
            Self::Acquiring => "acquiring",
            Self::Misconfigured => "misconfigured",
        };
        f.write_str(name)
    }
}

/// Edge the trigger fires on, stored as a float in [`TRG_MODE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Never trigger
    Disabled,
    /// Signal crosses the threshold upwards
    Rising,
    /// Signal crosses the threshold downwards
    Falling,
    /// Either direction
    Both,
}

impl TriggerMode {
    /// Register encoding.
    pub fn as_register(self) -> f32 {
        match self {
            Self::Disabled => 0.0,
            Self::Rising => 1.0,
            Self::Falling => 2.0,
            Self::Both => 3.0,
        }
    }

    /// Decode a register value, rounding to the nearest mode.
    pub fn from_register(value: f32) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        match value.round() as i64 {
            0 => Some(Self::Disabled),
            1 => Some(Self::Rising),
            2 => Some(Self::Falling),
            3 => Some(Self::Both),
            _ => None,
        }
    }
}
