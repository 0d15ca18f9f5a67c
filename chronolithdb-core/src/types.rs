use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::StoreError;

/// A single recorded sample.
///
/// Points are immutable once written. On disk a point is the compact JSON
/// object `{"m": ..., "v": ..., "t": ...}`; the longer names
/// `measurement`/`value`/`timestamp` are a read-only view exposed through
/// the accessor methods (and accepted as input aliases when parsing), never
/// a second copy of the record. Serialization always emits the compact
/// names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(alias = "measurement")]
    m: String,
    #[serde(alias = "value")]
    v: f64,
    #[serde(alias = "timestamp")]
    t: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, value: f64, timestamp_ms: i64) -> Self {
        Self {
            m: measurement.into(),
            v: value,
            t: timestamp_ms,
        }
    }

    /// Measurement tag, e.g. `"temperature"`.
    pub fn measurement(&self) -> &str {
        &self.m
    }

    /// Recorded value.
    pub fn value(&self) -> f64 {
        self.v
    }

    /// Milliseconds since the Unix epoch, UTC.
    pub fn timestamp(&self) -> i64 {
        self.t
    }

    /// Long-name JSON projection `{"measurement", "value", "timestamp"}`
    /// for callers that serialize query results outward. The stored record
    /// keeps its compact field names.
    pub fn aliased_json(&self) -> serde_json::Value {
        json!({
            "measurement": self.m,
            "value": self.v,
            "timestamp": self.t,
        })
    }
}

/// Bucket granularity for shard files.
///
/// `Hour` shards one file per UTC hour, `Minute` one per UTC minute. The
/// frame governs both the shard file name grammar and the leaf shape of the
/// directory index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    Hour,
    Minute,
}

impl Frame {
    /// Width of one bucket in milliseconds.
    pub fn bucket_ms(self) -> i64 {
        match self {
            Frame::Hour => 3_600_000,
            Frame::Minute => 60_000,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Hour => write!(f, "hour"),
            Frame::Minute => write!(f, "minute"),
        }
    }
}

impl FromStr for Frame {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Frame::Hour),
            "minute" => Ok(Frame::Minute),
            other => Err(StoreError::Parse {
                path: String::new(),
                detail: format!("unknown frame `{other}`, expected `hour` or `minute`"),
            }),
        }
    }
}
