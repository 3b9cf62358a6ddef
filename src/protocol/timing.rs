//! Conversion between timing registers and seconds.
//!
//! The firmware samples at the onboard polling rate and keeps every `divider`-th sample, so a
//! full buffer spans `divider * buffer_length / rate` seconds and the pretrigger part spans
//! `pretrigger * divider / rate` seconds.

/// Raw timing registers of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRegisters {
    /// Sample-rate decimation factor, at least 1
    pub divider: u32,
    /// Samples kept before the trigger, at most the buffer length
    pub pretrigger: u32,
}

impl TimingRegisters {
    /// Registers closest to the requested acquisition and pretrigger times.
    ///
    /// Rounding is half-to-even. Negative or non-finite requests clamp to the smallest value.
    pub fn from_seconds(
        acquisition_s: f64,
        pretrigger_s: f64,
        rate_hz: f64,
        buffer_length: u16,
    ) -> Self {
        let buffer_length = f64::from(buffer_length);
        let divider = (acquisition_s * rate_hz / buffer_length.max(1.0)).round_ties_even();
        let divider = clamp_to_u32(divider).max(1);

        let pretrigger = (pretrigger_s * rate_hz / f64::from(divider)).round_ties_even();
        let pretrigger = clamp_to_u32(pretrigger.min(buffer_length));

        Self {
            divider,
            pretrigger,
        }
    }

    /// `(acquisition, pretrigger)` in seconds.
    pub fn to_seconds(self, rate_hz: f64, buffer_length: u16) -> (f64, f64) {
        let divider = f64::from(self.divider);
        (
            divider * f64::from(buffer_length) / rate_hz,
            f64::from(self.pretrigger) * divider / rate_hz,
        )
    }
}

fn clamp_to_u32(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}
