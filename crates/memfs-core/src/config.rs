//! Configuration types for memfs core

use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Case sensitivity modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseSensitivity {
    Sensitive,
    InsensitivePreserving,
}

impl CaseSensitivity {
    /// Collation key for a name. Two names are the same entry iff their keys are equal.
    pub fn key<'a>(&self, name: &'a str) -> Cow<'a, str> {
        match self {
            CaseSensitivity::Sensitive => Cow::Borrowed(name),
            CaseSensitivity::InsensitivePreserving => {
                if name.chars().any(char::is_uppercase) {
                    Cow::Owned(name.to_lowercase())
                } else {
                    Cow::Borrowed(name)
                }
            }
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        self.key(a).cmp(&self.key(b))
    }

    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        self.key(a) == self.key(b)
    }
}

/// Granularity every stored timestamp is truncated to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampResolution {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimestampResolution {
    pub fn truncate(&self, time: SystemTime) -> SystemTime {
        let Ok(since_epoch) = time.duration_since(UNIX_EPOCH) else {
            return time;
        };
        let nanos = since_epoch.subsec_nanos();
        let kept = match self {
            TimestampResolution::Nanoseconds => nanos,
            TimestampResolution::Microseconds => nanos - nanos % 1_000,
            TimestampResolution::Milliseconds => nanos - nanos % 1_000_000,
            TimestampResolution::Seconds => 0,
        };
        UNIX_EPOCH + Duration::new(since_epoch.as_secs(), kept)
    }

    pub fn now(&self) -> SystemTime {
        self.truncate(SystemTime::now())
    }
}

/// System limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_open_handles: u32,
    /// Ceiling on the number of storage blocks a single file may use.
    pub max_file_blocks: u32,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 10000,
            max_file_blocks: crate::inode::MAX_BLOCKS,
        }
    }
}

/// Creation context applied when a caller does not supply one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryDefaults {
    pub file_mode: u32,
    pub dir_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            file_mode: 0o644,
            dir_mode: 0o755,
            uid: 0,
            gid: 0,
        }
    }
}

/// Main filesystem configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub case_sensitivity: CaseSensitivity,
    /// Root names, e.g. `["/"]` or `["C:", "D:"]`. The first one anchors relative paths.
    pub roots: Vec<String>,
    pub timestamp_resolution: TimestampResolution,
    pub limits: FsLimits,
    pub defaults: EntryDefaults,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            case_sensitivity: CaseSensitivity::Sensitive,
            roots: vec!["/".to_string()],
            timestamp_resolution: TimestampResolution::Nanoseconds,
            limits: FsLimits::default(),
            defaults: EntryDefaults::default(),
        }
    }
}

impl FsConfig {
    /// Windows-like layout: case-insensitive names under drive-letter roots.
    pub fn windows(drives: &[&str]) -> Self {
        Self {
            case_sensitivity: CaseSensitivity::InsensitivePreserving,
            roots: drives.iter().map(|d| d.to_string()).collect(),
            timestamp_resolution: TimestampResolution::Microseconds,
            ..Self::default()
        }
    }
}
