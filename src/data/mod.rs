//! Captured data: sample arrays, the snapshot store and the live frame history.

pub mod array;
pub mod frame_history;
pub mod snapshot;

pub use array::ChannelData;
pub use frame_history::{Frame, FrameHistory};
pub use snapshot::{CaptureTiming, LoadReport, Snapshot, SnapshotId, SnapshotStore};
