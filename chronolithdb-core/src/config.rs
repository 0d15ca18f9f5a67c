// Engine configuration.
//
// ChronolithDB is configured programmatically: the host constructs an
// `EngineConfig`, overrides what it needs, and hands it to the engine at
// open time. There are no configuration files and no environment variables;
// constrained targets rarely have either.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::types::Frame;

/// Default root directory for shard files and the index envelopes.
pub const DEFAULT_DIRECTORY: &str = "easy_timeseries_db";

/// Default RAM buffer ceiling before a synchronous flush (bytes).
pub const DEFAULT_RAM_CEILING_BYTES: usize = 204_800;

/// Default trailing-edge autosave debounce.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(600);

/// Options accepted by the engine at open time.
///
/// All fields have defaults suitable for a small always-on device: hourly
/// shards under `easy_timeseries_db/`, a 200 KiB write buffer, and a ten
/// minute autosave debounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for shards and the index.
    pub directory: PathBuf,

    /// Bucket granularity; governs shard routing and the index leaf shape.
    pub frame: Frame,

    /// RAM buffer overflow threshold. Crossing it triggers a synchronous
    /// flush inside `write_point`.
    pub ram_ceiling_bytes: usize,

    /// Debounce for the timer-driven flush + index persist. Trailing-edge:
    /// each write pushes the deadline out again.
    pub autosave_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            frame: Frame::Hour,
            ram_ceiling_bytes: DEFAULT_RAM_CEILING_BYTES,
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Validate numeric bounds before the engine starts using them.
    pub fn validate(&self) -> Result<()> {
        if self.ram_ceiling_bytes == 0 {
            return Err(StoreError::Parse {
                path: self.directory.display().to_string(),
                detail: "ram_ceiling_bytes must be greater than 0".into(),
            });
        }
        if self.autosave_interval.is_zero() {
            return Err(StoreError::Parse {
                path: self.directory.display().to_string(),
                detail: "autosave_interval must be greater than 0".into(),
            });
        }
        Ok(())
    }
}
