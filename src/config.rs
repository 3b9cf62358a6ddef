//! Configuration System using Figment
//!
//! Settings are owned by the user's settings file and are read-only for the core. They are
//! loaded from (later sources override earlier ones):
//! 1. built-in defaults
//! 2. `<config dir>/vscope/config.toml` (or the legacy `.vscopeconfig` in the same directory)
//! 3. environment variables prefixed with `VSCOPE_` (e.g. `VSCOPE_SERIAL_BAUD=9600`)
//!
//! The file is flat, mirroring the settings editor:
//!
//! ```toml
//! onboard_polling_rate = 50000.0
//! cache_gc_days = 31
//! serial_baud = 115200
//! serial_data_bits = 8
//! serial_stop_bits = 1.0
//! serial_parity = "N"
//! usb_vid = "0x0483"
//! usb_pid = "0x5740, 0x5741"
//! usb_name_regex = "vscope"
//! ```
//!
//! Out-of-range serial values silently fall back to the defaults, and unparsable USB id lists
//! are treated as empty so that nothing matches.

use crate::error::{AppResult, VscopeError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Polling rate used when the configured one is missing or unusable.
pub const DEFAULT_POLLING_RATE_HZ: f64 = 50_000.0;
/// Snapshot retention used when none is configured.
pub const DEFAULT_RETENTION_DAYS: u32 = 31;
/// Default serial speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Flat application settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Acquisition tick rate of the onboard sampler, used for timing conversion (Hz)
    #[serde(default = "default_polling_rate")]
    pub onboard_polling_rate: f64,
    /// Snapshot cache retention in days
    #[serde(default = "default_retention_days")]
    pub cache_gc_days: u32,
    /// Serial speed
    #[serde(default = "default_baud")]
    pub serial_baud: u32,
    /// 5, 6, 7 or 8
    #[serde(default = "default_data_bits")]
    pub serial_data_bits: u8,
    /// 1, 1.5 or 2
    #[serde(default = "default_stop_bits")]
    pub serial_stop_bits: f64,
    /// N, E, O, M or S
    #[serde(default = "default_parity")]
    pub serial_parity: String,
    /// USB vendor ids, comma/space/semicolon separated, decimal or `0x` hex
    #[serde(default)]
    pub usb_vid: String,
    /// USB product ids, same format as `usb_vid`
    #[serde(default)]
    pub usb_pid: String,
    /// Optional case-insensitive regex matched against the port description
    #[serde(default)]
    pub usb_name_regex: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_polling_rate() -> f64 {
    DEFAULT_POLLING_RATE_HZ
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> f64 {
    1.0
}

fn default_parity() -> String {
    "N".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            onboard_polling_rate: default_polling_rate(),
            cache_gc_days: default_retention_days(),
            serial_baud: default_baud(),
            serial_data_bits: default_data_bits(),
            serial_stop_bits: default_stop_bits(),
            serial_parity: default_parity(),
            usb_vid: String::new(),
            usb_pid: String::new(),
            usb_name_regex: String::new(),
        }
    }
}

impl Settings {
    /// Directory holding the settings file: `<config dir>/vscope`.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vscope")
    }

    /// Primary settings file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load settings from the user's config directory and the environment.
    ///
    /// The legacy `.vscopeconfig` file is only consulted when `config.toml` is absent.
    pub fn load() -> AppResult<Self> {
        let primary = Self::config_path();
        let path = if primary.exists() {
            primary
        } else {
            Self::config_dir().join(".vscopeconfig")
        };
        Self::load_from(path)
    }

    /// Load settings from a specific file path. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VSCOPE_"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(VscopeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.usb_vid.trim().is_empty() || self.usb_pid.trim().is_empty() {
            return Err(VscopeError::Configuration(
                "USB VID and PID are required. Set both usb_vid and usb_pid in the settings file"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Onboard polling rate, falling back to 50 kHz when absent or non-positive.
    pub fn polling_rate(&self) -> f64 {
        if self.onboard_polling_rate.is_finite() && self.onboard_polling_rate > 0.0 {
            self.onboard_polling_rate
        } else {
            DEFAULT_POLLING_RATE_HZ
        }
    }

    /// Normalized serial line settings used for opening ports and change detection.
    pub fn serial(&self) -> SerialSettings {
        let data_bits = match self.serial_data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if self.serial_stop_bits == 1.5 {
            StopBits::OnePointFive
        } else if self.serial_stop_bits == 2.0 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let parity = match self.serial_parity.trim().to_ascii_uppercase().as_str() {
            "E" => Parity::Even,
            "O" => Parity::Odd,
            "M" => Parity::Mark,
            "S" => Parity::Space,
            _ => Parity::None,
        };

        SerialSettings {
            baud: self.serial_baud,
            data_bits,
            stop_bits,
            parity,
        }
    }

    /// USB discovery filter built from the id lists and the optional name pattern.
    pub fn usb_filter(&self) -> UsbFilter {
        let ids = parse_id_list(&self.usb_vid).and_then(|vids| {
            parse_id_list(&self.usb_pid).map(|pids| (vids, pids))
        });
        let (vids, pids) = match ids {
            Some(lists) => lists,
            None => {
                warn!(
                    usb_vid = %self.usb_vid,
                    usb_pid = %self.usb_pid,
                    "Unparsable USB id list, no port will match"
                );
                (Vec::new(), Vec::new())
            }
        };

        let pattern = self.usb_name_regex.trim();
        let name_pattern = if pattern.is_empty() {
            None
        } else {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern, error = %e, "Ignoring invalid usb_name_regex");
                    None
                }
            }
        };

        UsbFilter::new(vids, pids, name_pattern)
    }
}

/// Split an id list on commas, semicolons and whitespace and parse every entry.
///
/// Returns `None` as soon as one entry is not a valid decimal or `0x` hex `u16`.
fn parse_id_list(value: &str) -> Option<Vec<u16>> {
    value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let lower = part.to_ascii_lowercase();
            match lower.strip_prefix("0x") {
                Some(hex) => u16::from_str_radix(hex, 16).ok(),
                None => lower.parse::<u16>().ok(),
            }
        })
        .collect()
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 1.5 stop bits
    OnePointFive,
    /// 2 stop bits
    Two,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
    /// Parity bit always set
    Mark,
    /// Parity bit always cleared
    Space,
}

/// Normalized serial line parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    pub baud: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Which USB serial ports belong to the fleet.
#[derive(Debug, Clone)]
pub struct UsbFilter {
    pairs: Vec<(u16, u16)>,
    name_pattern: Option<Regex>,
}

impl UsbFilter {
    /// Build a filter from vendor and product id lists.
    ///
    /// Lists of equal length are zipped pairwise, otherwise every vendor id is combined with
    /// every product id. If either list is empty the filter matches nothing.
    pub fn new(vids: Vec<u16>, pids: Vec<u16>, name_pattern: Option<Regex>) -> Self {
        let pairs = if vids.len() == pids.len() {
            vids.into_iter().zip(pids).collect()
        } else {
            vids.iter()
                .flat_map(|&vid| pids.iter().map(move |&pid| (vid, pid)))
                .collect()
        };
        Self {
            pairs,
            name_pattern,
        }
    }

    /// Whether a port with the given USB identity and description belongs to the fleet.
    pub fn matches(&self, vid: Option<u16>, pid: Option<u16>, description: &str) -> bool {
        let ids_ok = match (vid, pid) {
            (Some(vid), Some(pid)) => self.pairs.contains(&(vid, pid)),
            _ => false,
        };
        let name_ok = self
            .name_pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(description));
        ids_ok && name_ok
    }
}
