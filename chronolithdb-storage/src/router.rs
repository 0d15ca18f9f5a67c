//! Shard routing.
//!
//! Pure calendar math: a timestamp projects onto exactly one wall-clock
//! bucket, and the bucket onto exactly one file name. The measurement tag
//! is deliberately not part of the path; points of different measurements
//! share a shard and are told apart by their `m` field.
//!
//! File name grammar (underscores only, never `-`):
//!
//! - hour frame:   `YYYY_MM_DD_HH.json`
//! - minute frame: `YYYY_MM_DD_HH_MM.json`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};

use chronolithdb_core::error::{Result, StoreError};
use chronolithdb_core::types::Frame;

/// The resolved bucket for one timestamp: its index keys and shard path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAddress {
    pub date_key: String,
    pub hour_key: String,
    /// Present only under the minute frame.
    pub minute_key: Option<String>,
    pub path: PathBuf,
}

impl ShardAddress {
    /// File name component of `path`.
    pub fn file_name(&self) -> String {
        shard_file_name(&self.date_key, &self.hour_key, self.minute_key.as_deref())
    }
}

/// Compute the zero-padded UTC bucket keys for a timestamp.
pub fn bucket_keys(timestamp_ms: i64, frame: Frame) -> Result<(String, String, Option<String>)> {
    let utc: DateTime<Utc> =
        DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| StoreError::Parse {
            path: String::new(),
            detail: format!("timestamp {timestamp_ms} is outside the representable range"),
        })?;
    let date_key = format!("{:04}_{:02}_{:02}", utc.year(), utc.month(), utc.day());
    let hour_key = format!("{:02}", utc.hour());
    let minute_key = match frame {
        Frame::Hour => None,
        Frame::Minute => Some(format!("{:02}", utc.minute())),
    };
    Ok((date_key, hour_key, minute_key))
}

/// Render the shard file name for a set of bucket keys.
pub fn shard_file_name(date_key: &str, hour_key: &str, minute_key: Option<&str>) -> String {
    match minute_key {
        Some(minute) => format!("{date_key}_{hour_key}_{minute}.json"),
        None => format!("{date_key}_{hour_key}.json"),
    }
}

/// Map `(timestamp, frame)` onto its shard address under `directory`.
pub fn route(directory: &Path, timestamp_ms: i64, frame: Frame) -> Result<ShardAddress> {
    let (date_key, hour_key, minute_key) = bucket_keys(timestamp_ms, frame)?;
    let file = shard_file_name(&date_key, &hour_key, minute_key.as_deref());
    Ok(ShardAddress {
        path: directory.join(file),
        date_key,
        hour_key,
        minute_key,
    })
}

/// Invert the file name grammar, e.g. for index rebuilds from a directory
/// scan. Returns `None` for names that are not shard files of the given
/// frame (the index envelopes among them).
pub fn parse_shard_file_name(
    name: &str,
    frame: Frame,
) -> Option<(String, String, Option<String>)> {
    let stem = name.strip_suffix(".json")?;
    let parts: Vec<&str> = stem.split('_').collect();
    let expected = match frame {
        Frame::Hour => 4,
        Frame::Minute => 5,
    };
    if parts.len() != expected {
        return None;
    }
    if parts[0].len() != 4 || !parts[0].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    for part in &parts[1..] {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    let date_key = format!("{}_{}_{}", parts[0], parts[1], parts[2]);
    let hour_key = parts[3].to_string();
    let minute_key = (frame == Frame::Minute).then(|| parts[4].to_string());
    Some((date_key, hour_key, minute_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T12:34:56.789Z
    const TS: i64 = 1_710_506_096_789;

    #[test]
    fn hour_frame_routing() {
        let addr = route(Path::new("data"), TS, Frame::Hour).unwrap();
        assert_eq!(addr.date_key, "2024_03_15");
        assert_eq!(addr.hour_key, "12");
        assert_eq!(addr.minute_key, None);
        assert_eq!(addr.path, Path::new("data").join("2024_03_15_12.json"));
    }

    #[test]
    fn minute_frame_routing() {
        let addr = route(Path::new("data"), TS, Frame::Minute).unwrap();
        assert_eq!(addr.minute_key.as_deref(), Some("34"));
        assert_eq!(addr.file_name(), "2024_03_15_12_34.json");
    }

    #[test]
    fn keys_are_zero_padded() {
        // 2024-01-05T03:07:00Z
        let (date, hour, minute) = bucket_keys(1_704_424_020_000, Frame::Minute).unwrap();
        assert_eq!(date, "2024_01_05");
        assert_eq!(hour, "03");
        assert_eq!(minute.as_deref(), Some("07"));
    }

    #[test]
    fn grammar_round_trips() {
        let (date, hour, minute) =
            parse_shard_file_name("2024_03_15_12.json", Frame::Hour).unwrap();
        assert_eq!(shard_file_name(&date, &hour, minute.as_deref()), "2024_03_15_12.json");

        let (date, hour, minute) =
            parse_shard_file_name("2024_03_15_12_34.json", Frame::Minute).unwrap();
        assert_eq!(
            shard_file_name(&date, &hour, minute.as_deref()),
            "2024_03_15_12_34.json"
        );
    }

    #[test]
    fn grammar_rejects_foreign_names() {
        assert!(parse_shard_file_name("index.json", Frame::Hour).is_none());
        assert!(parse_shard_file_name("index_backup.json", Frame::Hour).is_none());
        assert!(parse_shard_file_name("2024_03_15_12.json", Frame::Minute).is_none());
        assert!(parse_shard_file_name("2024_03_15_12_34.json", Frame::Hour).is_none());
        assert!(parse_shard_file_name("2024-03-15-12.json", Frame::Hour).is_none());
        assert!(parse_shard_file_name("2024_03_15_12.txt", Frame::Hour).is_none());
    }

    #[test]
    fn bucket_boundaries_split_points() {
        // One millisecond before and after 13:00:00Z land in different hours.
        let before = bucket_keys(1_710_507_599_999, Frame::Hour).unwrap();
        let after = bucket_keys(1_710_507_600_000, Frame::Hour).unwrap();
        assert_eq!(before.1, "12");
        assert_eq!(after.1, "13");
    }
}
