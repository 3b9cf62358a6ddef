//! Snapshot Store
//!
//! A snapshot is one complete, timestamped capture of every device in the fleet. The store
//! keeps snapshots in memory, persists them under the platform cache directory and loads their
//! metadata back on startup, leaving the sample arrays on disk until they are needed.
//!
//! ## Cache layout
//!
//! ```text
//! <cache dir>/vscope/
//!   <uid>/
//!     metadata.json   description, dimensions, timing, channel labels
//!     data.json       {"<device id>": [[ch0 samples], [ch1 samples], ...], ...}
//! ```
//!
//! `<uid>` is the creation time in seconds since the Unix epoch. Entries older than the
//! configured retention are deleted when the cache is loaded.

use crate::data::array::ChannelData;
use crate::error::{AppResult, VscopeError};
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const DATA_FILE: &str = "data.json";
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Creation timestamp of a snapshot, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(f64);

impl SnapshotId {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros() as f64 / 1_000_000.0)
    }

    /// Wrap a timestamp.
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Seconds since the Unix epoch.
    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Creation time, if representable.
    pub fn created_at(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros((self.0 * 1_000_000.0) as i64)
    }

    /// Smallest id strictly greater than this one.
    fn next_up(self) -> Self {
        if self.0.is_finite() && self.0 >= 0.0 {
            Self(f64::from_bits(self.0.to_bits() + 1))
        } else {
            Self(0.0)
        }
    }
}

impl PartialEq for SnapshotId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SnapshotId {}

impl PartialOrd for SnapshotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnapshotId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = VscopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() => Ok(Self(secs)),
            _ => Err(VscopeError::UnknownSnapshot(s.to_string())),
        }
    }
}

/// Acquisition window of a capture, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureTiming {
    /// Length of the whole buffer
    pub acquisition_time: f64,
    /// Part of the buffer before the trigger
    pub pretrigger_time: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    uid: Option<f64>,
    description: String,
    channels: usize,
    buffer_length: usize,
    acquisition_time: Option<f64>,
    pretrigger_time: Option<f64>,
    #[serde(default)]
    channel_labels: Vec<String>,
}

/// One multi-device capture.
#[derive(Debug, Clone)]
pub struct Snapshot {
    uid: SnapshotId,
    description: String,
    channels: usize,
    buffer_length: usize,
    timing: Option<CaptureTiming>,
    channel_labels: Vec<String>,
    data: Option<BTreeMap<String, ChannelData>>,
    dir: PathBuf,
}

impl Snapshot {
    /// Creation id.
    pub fn uid(&self) -> SnapshotId {
        self.uid
    }

    /// User supplied description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Channels per device.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per channel.
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Acquisition window, when it was known at capture time.
    pub fn timing(&self) -> Option<CaptureTiming> {
        self.timing
    }

    /// Channel labels of the capturing fleet.
    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }

    /// Directory holding the persisted files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the sample arrays are in memory.
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    /// Store the capture of one device. The array must be `[channels, buffer_length]`.
    ///
    /// A repeated device id is stored as `<id>_`, then `<id>_2`, `<id>_3`, ... Returns the key
    /// actually used.
    pub fn set_data(&mut self, device_id: &str, data: ChannelData) -> AppResult<String> {
        self.check_shape(&data)?;
        let map = self.data.get_or_insert_with(BTreeMap::new);
        Ok(insert_unique(map, device_id, data))
    }

    fn check_shape(&self, data: &ChannelData) -> AppResult<()> {
        let expected = (self.channels, self.buffer_length);
        if data.shape() != expected {
            return Err(VscopeError::ShapeMismatch {
                expected,
                actual: data.shape(),
            });
        }
        Ok(())
    }

    /// All device arrays, loaded from disk on first access.
    ///
    /// A cache file that fails to parse or holds a wrongly shaped array is an error every
    /// time; nothing is kept from it.
    pub fn get_data(&mut self) -> AppResult<&BTreeMap<String, ChannelData>> {
        if self.data.is_none() {
            let path = self.data_path();
            let loaded = match fs::read(&path) {
                Ok(raw) => {
                    let stored: BTreeMap<String, ChannelData> = serde_json::from_slice(&raw)?;
                    let mut loaded = BTreeMap::new();
                    for (device_id, array) in stored {
                        self.check_shape(&array).map_err(|e| {
                            VscopeError::CorruptCache(format!("{}: {e}", path.display()))
                        })?;
                        insert_unique(&mut loaded, &device_id, array);
                    }
                    debug!(uid = %self.uid, "Loaded snapshot data from cache");
                    loaded
                }
                Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => return Err(e.into()),
            };
            self.data = Some(loaded);
        }
        Ok(&*self.data.get_or_insert_with(BTreeMap::new))
    }

    /// Persist metadata and, when there is any, the sample arrays.
    pub fn cache(&mut self) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = Metadata {
            uid: Some(self.uid.as_secs()),
            description: self.description.clone(),
            channels: self.channels,
            buffer_length: self.buffer_length,
            acquisition_time: self.timing.map(|t| t.acquisition_time),
            pretrigger_time: self.timing.map(|t| t.pretrigger_time),
            channel_labels: self.channel_labels.clone(),
        };
        fs::write(
            self.dir.join(METADATA_FILE),
            serde_json::to_vec_pretty(&metadata)?,
        )?;

        let path = self.data_path();
        let data = self.get_data()?;
        if !data.is_empty() {
            fs::write(path, serde_json::to_vec(data)?)?;
        }
        debug!(uid = %self.uid, dir = %self.dir.display(), "Snapshot cached");
        Ok(())
    }

    /// Remove the persisted files. A missing directory is not an error.
    pub fn delete(&self) -> AppResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Device ids in this snapshot, without loading the arrays into memory.
    pub fn device_ids(&self) -> AppResult<Vec<String>> {
        if let Some(data) = &self.data {
            return Ok(data.keys().cloned().collect());
        }
        match fs::read(self.data_path()) {
            Ok(raw) => {
                let stored: BTreeMap<String, IgnoredAny> = serde_json::from_slice(&raw)?;
                Ok(stored.into_keys().collect())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of devices in this snapshot.
    pub fn device_count(&self) -> AppResult<usize> {
        Ok(self.device_ids()?.len())
    }

    /// Drop the in-memory arrays if they can be reloaded from disk.
    pub fn evict(&mut self) -> bool {
        if self.data.is_some() && self.data_path().is_file() {
            self.data = None;
            true
        } else {
            false
        }
    }

    fn comparable_with(&self, other: &Snapshot) -> bool {
        self.channels == other.channels
            && self.buffer_length == other.buffer_length
            && self.timing.is_some()
            && self.timing == other.timing
            && self.channel_labels == other.channel_labels
    }
}

/// Outcome of [`SnapshotStore::load_from_cache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Snapshots registered with their data left on disk
    pub registered: usize,
    /// Entries deleted for exceeding the retention
    pub collected: usize,
    /// Entries that could not be read or were already registered
    pub skipped: usize,
}

/// All known snapshots, keyed by uid.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    last_uid: Option<SnapshotId>,
}

impl SnapshotStore {
    /// A store persisting under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots: BTreeMap::new(),
            last_uid: None,
        }
    }

    /// `<platform cache dir>/vscope`
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vscope")
    }

    /// A store persisting under [`SnapshotStore::default_root`].
    pub fn open_default() -> Self {
        Self::new(Self::default_root())
    }

    /// Cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register an empty snapshot and return its id, strictly greater than any id issued before.
    pub fn create(
        &mut self,
        description: &str,
        channels: usize,
        buffer_length: usize,
        timing: Option<CaptureTiming>,
        channel_labels: Vec<String>,
    ) -> SnapshotId {
        let mut uid = SnapshotId::now();
        if let Some(last) = self.last_uid {
            if uid <= last {
                uid = last.next_up();
            }
        }
        self.last_uid = Some(uid);

        self.snapshots.insert(
            uid,
            Snapshot {
                uid,
                description: description.to_string(),
                channels,
                buffer_length,
                timing,
                channel_labels,
                data: Some(BTreeMap::new()),
                dir: self.root.join(uid.to_string()),
            },
        );
        info!(%uid, description, "Snapshot created");
        uid
    }

    /// Snapshot by id.
    pub fn get(&self, uid: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.get(&uid)
    }

    /// Mutable snapshot by id.
    pub fn get_mut(&mut self, uid: SnapshotId) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(&uid)
    }

    /// All snapshots, most recent first.
    pub fn list(&self) -> Vec<&Snapshot> {
        self.snapshots.values().rev().collect()
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Delete a snapshot from disk and memory.
    pub fn remove(&mut self, uid: SnapshotId) -> AppResult<()> {
        let snapshot = self
            .snapshots
            .get(&uid)
            .ok_or_else(|| VscopeError::UnknownSnapshot(uid.to_string()))?;
        snapshot.delete()?;
        self.snapshots.remove(&uid);
        info!(%uid, "Snapshot deleted");
        Ok(())
    }

    /// Forget a snapshot without touching the disk.
    pub fn discard(&mut self, uid: SnapshotId) -> Option<Snapshot> {
        self.snapshots.remove(&uid)
    }

    /// Register cached snapshots and delete those older than `retention_days`.
    ///
    /// Data arrays stay on disk until [`Snapshot::get_data`] is called. Unreadable entries are
    /// skipped and left in place.
    pub fn load_from_cache(&mut self, retention_days: u32) -> AppResult<LoadReport> {
        let mut report = LoadReport::default();
        if !self.root.is_dir() {
            return Ok(report);
        }

        let cutoff = SnapshotId::now().as_secs() - f64::from(retention_days) * SECONDS_PER_DAY;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let uid_from_name = name.parse::<SnapshotId>().ok();
            let metadata = read_metadata(&dir);

            let age_uid = uid_from_name.or_else(|| {
                metadata
                    .as_ref()
                    .ok()
                    .and_then(|meta| meta.uid)
                    .map(SnapshotId::from_secs)
            });
            if age_uid.is_some_and(|uid| uid.as_secs() <= cutoff) {
                match fs::remove_dir_all(&dir) {
                    Ok(()) => debug!(dir = %dir.display(), "Expired snapshot removed"),
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Could not remove expired snapshot"),
                }
                report.collected += 1;
                continue;
            }

            let snapshot = metadata.and_then(|meta| {
                let uid = meta
                    .uid
                    .map(SnapshotId::from_secs)
                    .or(uid_from_name)
                    .ok_or_else(|| VscopeError::CorruptCache(format!("{name}: no uid")))?;
                let timing = match (meta.acquisition_time, meta.pretrigger_time) {
                    (Some(acquisition_time), Some(pretrigger_time)) => Some(CaptureTiming {
                        acquisition_time,
                        pretrigger_time,
                    }),
                    (None, None) => None,
                    _ => {
                        return Err(VscopeError::CorruptCache(format!(
                            "{name}: incomplete timing"
                        )))
                    }
                };
                Ok(Snapshot {
                    uid,
                    description: meta.description,
                    channels: meta.channels,
                    buffer_length: meta.buffer_length,
                    timing,
                    channel_labels: meta.channel_labels,
                    data: None,
                    dir: dir.clone(),
                })
            });

            match snapshot {
                Ok(snapshot) if self.snapshots.contains_key(&snapshot.uid) => report.skipped += 1,
                Ok(snapshot) => {
                    self.last_uid = self.last_uid.max(Some(snapshot.uid));
                    self.snapshots.insert(snapshot.uid, snapshot);
                    report.registered += 1;
                }
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping cache entry");
                    report.skipped += 1;
                }
            }
        }

        info!(
            registered = report.registered,
            collected = report.collected,
            skipped = report.skipped,
            "Snapshot cache loaded"
        );
        Ok(report)
    }

    /// Whether the snapshots can be overlaid: at least two, all present, with identical
    /// dimensions, timing and labels. Snapshots without timing are never comparable.
    pub fn can_be_compared(&self, uids: &[SnapshotId]) -> bool {
        if uids.len() < 2 {
            return false;
        }
        let Some(snapshots) = uids
            .iter()
            .map(|uid| self.snapshots.get(uid))
            .collect::<Option<Vec<_>>>()
        else {
            return false;
        };
        let first = snapshots[0];
        first.timing.is_some() && snapshots[1..].iter().all(|other| first.comparable_with(other))
    }
}

/// Insert under `device_id`, or `<id>_`, `<id>_2`, ... when taken. Returns the key used.
fn insert_unique(
    map: &mut BTreeMap<String, ChannelData>,
    device_id: &str,
    data: ChannelData,
) -> String {
    let key = if !map.contains_key(device_id) {
        device_id.to_string()
    } else {
        let mut key = format!("{device_id}_");
        let mut suffix = 1;
        while map.contains_key(&key) {
            suffix += 1;
            key = format!("{device_id}_{suffix}");
        }
        key
    };
    map.insert(key.clone(), data);
    key
}

fn read_metadata(dir: &Path) -> AppResult<Metadata> {
    let raw = fs::read(dir.join(METADATA_FILE))?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(acquisition_time: f64) -> Option<CaptureTiming> {
        Some(CaptureTiming {
            acquisition_time,
            pretrigger_time: 0.1,
        })
    }

    fn labels() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn data(value: f32) -> ChannelData {
        ChannelData::from_rows(vec![vec![value; 3], vec![value; 3]]).unwrap()
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let ids: Vec<_> = (0..50)
            .map(|_| store.create("x", 2, 3, None, labels()))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(store.list()[0].uid(), ids[49]);
    }

    #[test]
    fn id_text_round_trip() {
        let id = SnapshotId::from_secs(1_700_000_000.25);
        assert_eq!(id.to_string(), "1700000000.25");
        assert_eq!("1700000000.25".parse::<SnapshotId>().unwrap(), id);
        assert!("soon".parse::<SnapshotId>().is_err());
        assert!("inf".parse::<SnapshotId>().is_err());
        assert!(id.created_at().is_some());
    }

    #[test]
    fn wrong_shape_leaves_data_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("x", 2, 3, None, labels());
        let snapshot = store.get_mut(uid).unwrap();
        snapshot.set_data("dev", data(1.0)).unwrap();

        let wrong = ChannelData::from_rows(vec![vec![0.0; 2]; 3]).unwrap();
        let err = snapshot.set_data("dev", wrong).unwrap_err();
        assert!(matches!(
            err,
            VscopeError::ShapeMismatch {
                expected: (2, 3),
                actual: (3, 2)
            }
        ));
        let stored = snapshot.get_data().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["dev"], data(1.0));
    }

    #[test]
    fn duplicate_device_ids_are_suffixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("x", 2, 3, None, labels());
        let snapshot = store.get_mut(uid).unwrap();
        assert_eq!(snapshot.set_data("dev", data(1.0)).unwrap(), "dev");
        assert_eq!(snapshot.set_data("dev", data(2.0)).unwrap(), "dev_");
        assert_eq!(snapshot.set_data("dev", data(3.0)).unwrap(), "dev_2");
        assert_eq!(snapshot.set_data("dev", data(4.0)).unwrap(), "dev_3");
    }

    #[test]
    fn cache_then_lazy_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("bench", 2, 3, timing(1.0), labels());
        {
            let snapshot = store.get_mut(uid).unwrap();
            snapshot.set_data("left", data(1.0)).unwrap();
            snapshot.set_data("right", data(2.0)).unwrap();
            snapshot.cache().unwrap();
        }

        let mut reloaded = SnapshotStore::new(dir.path());
        let report = reloaded.load_from_cache(31).unwrap();
        assert_eq!(report.registered, 1);

        let snapshot = reloaded.get_mut(uid).unwrap();
        assert!(!snapshot.is_loaded());
        assert_eq!(snapshot.description(), "bench");
        assert_eq!(snapshot.timing(), timing(1.0));
        assert_eq!(snapshot.device_ids().unwrap(), vec!["left", "right"]);
        assert!(!snapshot.is_loaded());

        assert_eq!(snapshot.get_data().unwrap()["right"], data(2.0));
        assert!(snapshot.is_loaded());
        assert!(snapshot.evict());
        assert!(!snapshot.is_loaded());
    }

    #[test]
    fn snapshot_without_data_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("empty", 2, 3, None, labels());
        store.get_mut(uid).unwrap().cache().unwrap();

        let mut reloaded = SnapshotStore::new(dir.path());
        reloaded.load_from_cache(31).unwrap();
        let snapshot = reloaded.get_mut(uid).unwrap();
        assert!(snapshot.get_data().unwrap().is_empty());
        assert_eq!(snapshot.timing(), None);
    }

    #[test]
    fn remove_deletes_directory_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("x", 2, 3, None, labels());
        store.get_mut(uid).unwrap().cache().unwrap();
        let path = store.get(uid).unwrap().dir().to_path_buf();
        assert!(path.is_dir());

        store.remove(uid).unwrap();
        assert!(!path.exists());
        assert!(store.get(uid).is_none());
        assert!(matches!(store.remove(uid), Err(VscopeError::UnknownSnapshot(_))));
    }

    #[test]
    fn delete_of_uncached_snapshot_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let uid = store.create("x", 2, 3, None, labels());
        assert!(store.get(uid).unwrap().delete().is_ok());
    }

    #[test]
    fn comparability_requires_exact_equality() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::new(dir.path());
        let a = store.create("a", 2, 3, timing(1.0), labels());
        let b = store.create("b", 2, 3, timing(1.0), labels());
        let c = store.create("c", 2, 3, timing(1.0 + 1e-9), labels());
        let d = store.create("d", 2, 3, None, labels());
        let e = store.create("e", 2, 3, timing(1.0), vec!["a".into(), "z".into()]);

        assert!(!store.can_be_compared(&[a]));
        assert!(store.can_be_compared(&[a, b]));
        assert!(!store.can_be_compared(&[a, c]));
        assert!(!store.can_be_compared(&[a, d]));
        assert!(!store.can_be_compared(&[d, d]));
        assert!(!store.can_be_compared(&[a, e]));
        assert!(!store.can_be_compared(&[a, SnapshotId::from_secs(1.0)]));
    }
}
