use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::IrqError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Token accepted by the `gpio<N>/edge` node.
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_sysfs_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct InterruptConfig {
    pub sysfs_root: PathBuf,
    pub export_retries: u32,
    pub export_backoff_ms: u64,
    pub max_events: usize,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            export_retries: 20,
            export_backoff_ms: 50,
            max_events: 16,
        }
    }
}

impl InterruptConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, IrqError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| IrqError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| IrqError::Config(format!("Invalid config json: {e}")))
    }

    pub fn export_backoff(&self) -> Duration {
        Duration::from_millis(self.export_backoff_ms)
    }
}
