//! Rolling window of live frames.

use crate::data::array::ChannelData;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Frames kept by default, ten seconds at the default period.
pub const DEFAULT_CAPACITY: usize = 100;
/// Default spacing between frames.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// One live sample of every channel of every device.
pub type Frame = BTreeMap<String, Vec<f32>>;

/// Bounded history of frames, oldest first.
#[derive(Debug, Clone)]
pub struct FrameHistory {
    capacity: usize,
    period: Duration,
    entries: VecDeque<(DateTime<Utc>, Frame)>,
}

impl Default for FrameHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_PERIOD)
    }
}

impl FrameHistory {
    /// Empty history holding at most `capacity` frames.
    pub fn new(capacity: usize, period: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            period,
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Fill the window with NaN frames ending now, so a plot scrolls in from the right.
    ///
    /// Without devices the history is left empty.
    pub fn reset(&mut self, device_ids: &[String], channels: usize) {
        self.entries.clear();
        if device_ids.is_empty() || channels == 0 {
            return;
        }
        let now = Utc::now();
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::zero());
        let blank: Frame = device_ids
            .iter()
            .map(|id| (id.clone(), vec![f32::NAN; channels]))
            .collect();
        for index in 0..self.capacity {
            let steps_back = i32::try_from(self.capacity - index).unwrap_or(i32::MAX);
            self.entries.push_back((now - period * steps_back, blank.clone()));
        }
    }

    /// Append a frame, dropping the oldest when full.
    pub fn push(&mut self, timestamp: DateTime<Utc>, frame: Frame) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp, frame));
    }

    /// Number of frames held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no frame is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent frame.
    pub fn latest(&self) -> Option<&(DateTime<Utc>, Frame)> {
        self.entries.back()
    }

    /// Timestamps, oldest first.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.entries.iter().map(|(timestamp, _)| *timestamp).collect()
    }

    /// Per-device `[channel, frame]` arrays for the devices of the oldest frame.
    ///
    /// Frames where a device or channel is missing contribute NaN.
    pub fn series(&self) -> BTreeMap<String, ChannelData> {
        let Some((_, first)) = self.entries.front() else {
            return BTreeMap::new();
        };
        first
            .iter()
            .filter_map(|(device_id, values)| {
                let rows = (0..values.len())
                    .map(|channel| {
                        self.entries
                            .iter()
                            .map(|(_, frame)| {
                                frame
                                    .get(device_id)
                                    .and_then(|values| values.get(channel))
                                    .copied()
                                    .unwrap_or(f32::NAN)
                            })
                            .collect()
                    })
                    .collect();
                ChannelData::from_rows(rows)
                    .ok()
                    .map(|data| (device_id.clone(), data))
            })
            .collect()
    }
}
