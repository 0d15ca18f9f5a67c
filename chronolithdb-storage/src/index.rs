//! Directory index with checksummed dual-envelope persistence.
//!
//! The index answers "does a shard exist for this bucket" without touching
//! the filesystem on the query path. In memory it is a three-level tree
//! `date → hour → slot`, where the slot is either a bare present-marker
//! (hour frame) or a set of present minutes (minute frame); the tagged
//! [`HourSlot`] keeps the two shapes from mixing.
//!
//! On disk the index is wrapped in an envelope
//! `{"index_data": <payload>, "index_checksum": <decimal sum>}` and written
//! twice, `index.json` first and `index_backup.json` second, so that a
//! crash between the two writes always leaves one valid copy. The checksum
//! is the 16-bit modular sum of the payload's code units: a corruption
//! probe, not an authenticator; it does not detect reordering. Load walks
//! the recovery ladder: primary, then backup (re-persisting the primary),
//! then an empty index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use chronolithdb_core::error::{Result, StoreError};
use chronolithdb_core::types::Frame;

use crate::fs::FsAdapter;
use crate::router::{parse_shard_file_name, shard_file_name, ShardAddress};

/// Primary envelope file name, relative to the data directory.
pub const INDEX_FILE: &str = "index.json";

/// Backup envelope file name.
pub const INDEX_BACKUP_FILE: &str = "index_backup.json";

const CHECKSUM_MODULUS: u64 = 65_535;

/// Leaf of the index tree for one hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HourSlot {
    /// Hour-frame marker: the hour's shard file exists.
    Present,
    /// Minute-frame marker set: these minutes' shard files exist.
    Minutes(BTreeSet<String>),
}

/// Pure in-memory index tree, `date_key → hour_key → slot`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryIndex {
    dates: BTreeMap<String, BTreeMap<String, HourSlot>>,
}

impl DirectoryIndex {
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Number of present shard markers across all dates.
    pub fn shard_count(&self) -> usize {
        self.dates
            .values()
            .flat_map(|hours| hours.values())
            .map(|slot| match slot {
                HourSlot::Present => 1,
                HourSlot::Minutes(minutes) => minutes.len(),
            })
            .sum()
    }

    pub fn date_keys(&self) -> Vec<String> {
        self.dates.keys().cloned().collect()
    }

    /// Mark an hour-frame shard present. An existing minute-map for the
    /// hour is collapsed; one engine only ever runs a single frame.
    pub fn mark_hour(&mut self, date_key: &str, hour_key: &str) {
        self.dates
            .entry(date_key.to_string())
            .or_default()
            .insert(hour_key.to_string(), HourSlot::Present);
    }

    /// Mark a minute-frame shard present.
    pub fn mark_minute(&mut self, date_key: &str, hour_key: &str, minute_key: &str) {
        let hours = self.dates.entry(date_key.to_string()).or_default();
        match hours.get_mut(hour_key) {
            Some(HourSlot::Minutes(minutes)) => {
                minutes.insert(minute_key.to_string());
            }
            _ => {
                let mut minutes = BTreeSet::new();
                minutes.insert(minute_key.to_string());
                hours.insert(hour_key.to_string(), HourSlot::Minutes(minutes));
            }
        }
    }

    pub fn contains(&self, date_key: &str, hour_key: &str, minute_key: Option<&str>) -> bool {
        let Some(slot) = self.dates.get(date_key).and_then(|h| h.get(hour_key)) else {
            return false;
        };
        match (slot, minute_key) {
            (HourSlot::Present, None) => true,
            (HourSlot::Minutes(minutes), Some(minute)) => minutes.contains(minute),
            _ => false,
        }
    }

    pub fn drop_date(&mut self, date_key: &str) -> bool {
        self.dates.remove(date_key).is_some()
    }

    pub fn clear(&mut self) {
        self.dates.clear();
    }

    /// Shard file names implied by one date's subtree, in key order.
    pub fn shard_files_for_date(&self, date_key: &str) -> Vec<String> {
        let Some(hours) = self.dates.get(date_key) else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for (hour_key, slot) in hours {
            match slot {
                HourSlot::Present => files.push(shard_file_name(date_key, hour_key, None)),
                HourSlot::Minutes(minutes) => {
                    for minute in minutes {
                        files.push(shard_file_name(date_key, hour_key, Some(minute)));
                    }
                }
            }
        }
        files
    }

    /// JSON value form, `{date: {hour: true | {minute: true}}}`. This is
    /// the shape that is serialized into the envelope payload and embedded
    /// in backups.
    pub fn to_value(&self) -> Value {
        let mut dates = Map::new();
        for (date_key, hours) in &self.dates {
            let mut hour_map = Map::new();
            for (hour_key, slot) in hours {
                let leaf = match slot {
                    HourSlot::Present => Value::Bool(true),
                    HourSlot::Minutes(minutes) => {
                        let mut minute_map = Map::new();
                        for minute in minutes {
                            minute_map.insert(minute.clone(), Value::Bool(true));
                        }
                        Value::Object(minute_map)
                    }
                };
                hour_map.insert(hour_key.clone(), leaf);
            }
            dates.insert(date_key.clone(), Value::Object(hour_map));
        }
        Value::Object(dates)
    }

    /// Parse the JSON value form back into a tree. Rejects leaves that are
    /// neither `true` nor a minute map.
    pub fn from_value(value: &Value) -> std::result::Result<Self, String> {
        let Value::Object(dates) = value else {
            return Err("index root must be an object".into());
        };
        let mut index = DirectoryIndex::default();
        for (date_key, hours_value) in dates {
            let Value::Object(hours) = hours_value else {
                return Err(format!("date `{date_key}` must map to an object"));
            };
            for (hour_key, leaf) in hours {
                match leaf {
                    Value::Bool(true) => index.mark_hour(date_key, hour_key),
                    Value::Object(minutes) => {
                        for (minute_key, flag) in minutes {
                            if flag != &Value::Bool(true) {
                                return Err(format!(
                                    "minute `{date_key}/{hour_key}/{minute_key}` must be true"
                                ));
                            }
                            index.mark_minute(date_key, hour_key, minute_key);
                        }
                    }
                    other => {
                        return Err(format!(
                            "hour `{date_key}/{hour_key}` has unsupported leaf {other}"
                        ));
                    }
                }
            }
        }
        Ok(index)
    }
}

/// 16-bit modular sum over the payload's code units. The payload is ASCII
/// JSON, so bytes and UTF-16 code units coincide.
pub fn payload_checksum(payload: &str) -> u32 {
    (payload.bytes().map(u64::from).sum::<u64>() % CHECKSUM_MODULUS) as u32
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    index_data: String,
    index_checksum: String,
}

/// Which rung of the recovery ladder produced the loaded index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Primary,
    Backup,
    Fresh,
}

/// Owner of the in-memory index and its persistence protocol.
#[derive(Debug)]
pub struct IndexManager {
    directory: PathBuf,
    frame: Frame,
    index: DirectoryIndex,
    /// Checksum at the time of the last successful persist; `None` means
    /// never persisted (or reset since).
    last_persisted: Option<u32>,
}

impl IndexManager {
    pub fn new(directory: PathBuf, frame: Frame) -> Self {
        Self {
            directory,
            frame,
            index: DirectoryIndex::default(),
            last_persisted: None,
        }
    }

    pub fn index(&self) -> &DirectoryIndex {
        &self.index
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    fn primary_path(&self) -> PathBuf {
        self.directory.join(INDEX_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.directory.join(INDEX_BACKUP_FILE)
    }

    /// Record a shard address as present.
    pub fn mark_present(&mut self, addr: &ShardAddress) {
        match addr.minute_key.as_deref() {
            Some(minute) => self.index.mark_minute(&addr.date_key, &addr.hour_key, minute),
            None => self.index.mark_hour(&addr.date_key, &addr.hour_key),
        }
    }

    pub fn contains(&self, date_key: &str, hour_key: &str, minute_key: Option<&str>) -> bool {
        self.index.contains(date_key, hour_key, minute_key)
    }

    pub fn drop_date(&mut self, date_key: &str) -> bool {
        self.index.drop_date(date_key)
    }

    pub fn date_keys(&self) -> Vec<String> {
        self.index.date_keys()
    }

    /// Replace the in-memory tree wholesale (restore with a verbatim
    /// backup index). The differential-persist watermark is invalidated.
    pub fn adopt(&mut self, index: DirectoryIndex) {
        self.index = index;
        self.last_persisted = None;
    }

    /// Drop all in-memory state without touching disk.
    pub fn reset(&mut self) {
        self.index.clear();
        self.last_persisted = None;
    }

    fn payload(&self) -> Result<String> {
        serde_json::to_string(&self.index.to_value())
            .map_err(|e| StoreError::parse(&self.primary_path(), e.to_string()))
    }

    /// Checksum of the live in-memory index.
    pub fn checksum(&self) -> Result<u32> {
        Ok(payload_checksum(&self.payload()?))
    }

    /// Serialize, envelope, and write both copies, primary first and
    /// backup second, each with a single truncating write.
    pub fn persist(&mut self) -> Result<()> {
        let payload = self.payload()?;
        let checksum = payload_checksum(&payload);
        let envelope = Envelope {
            index_data: payload,
            index_checksum: checksum.to_string(),
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| StoreError::parse(&self.primary_path(), e.to_string()))?;
        FsAdapter::write_text_truncating(&self.primary_path(), &text)?;
        FsAdapter::write_text_truncating(&self.backup_path(), &text)?;
        self.last_persisted = Some(checksum);
        debug!(target: "chronolithdb::index", checksum, "index persisted");
        Ok(())
    }

    /// Persist only when the live checksum differs from the last persisted
    /// one. Returns whether a write happened.
    pub fn persist_if_changed(&mut self) -> Result<bool> {
        let live = self.checksum()?;
        if self.last_persisted == Some(live) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn try_load(path: &Path) -> Option<DirectoryIndex> {
        let text = match FsAdapter::read_text(path) {
            Ok(text) => text,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(target: "chronolithdb::index", path = %path.display(), error = %e, "envelope unreadable");
                }
                return None;
            }
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "chronolithdb::index", path = %path.display(), error = %e, "envelope does not parse");
                return None;
            }
        };
        let recomputed = payload_checksum(&envelope.index_data);
        if envelope.index_checksum != recomputed.to_string() {
            warn!(
                target: "chronolithdb::index",
                path = %path.display(),
                stored = %envelope.index_checksum,
                recomputed,
                "checksum mismatch"
            );
            return None;
        }
        let value: Value = match serde_json::from_str(&envelope.index_data) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "chronolithdb::index", path = %path.display(), error = %e, "payload does not parse");
                return None;
            }
        };
        match DirectoryIndex::from_value(&value) {
            Ok(index) => Some(index),
            Err(detail) => {
                warn!(target: "chronolithdb::index", path = %path.display(), detail, "payload has invalid shape");
                None
            }
        }
    }

    /// Recovery ladder executed at open: primary envelope, then backup
    /// (re-persisting the primary from it), then a fresh empty index
    /// (persisting both copies). A corrupted index never prevents reopen.
    pub fn load_or_recover(&mut self) -> Result<RecoverySource> {
        if let Some(index) = Self::try_load(&self.primary_path()) {
            self.index = index;
            self.last_persisted = Some(self.checksum()?);
            return Ok(RecoverySource::Primary);
        }
        if let Some(index) = Self::try_load(&self.backup_path()) {
            info!(target: "chronolithdb::index", "primary envelope invalid, recovered from backup");
            self.index = index;
            self.persist()?;
            return Ok(RecoverySource::Backup);
        }
        info!(target: "chronolithdb::index", "no valid envelope, starting with an empty index");
        self.index = DirectoryIndex::default();
        self.persist()?;
        Ok(RecoverySource::Fresh)
    }

    /// Rebuild the tree from a directory scan: every name that matches the
    /// shard file grammar of the configured frame becomes a present
    /// marker; the envelope files and foreign names are ignored. Returns
    /// the number of shards inserted.
    pub fn rebuild_from_disk(&mut self) -> Result<usize> {
        self.index.clear();
        self.last_persisted = None;
        let names = match FsAdapter::list(&self.directory) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let mut inserted = 0;
        for name in names {
            if name == INDEX_FILE || name == INDEX_BACKUP_FILE {
                continue;
            }
            let Some((date_key, hour_key, minute_key)) =
                parse_shard_file_name(&name, self.frame)
            else {
                continue;
            };
            match minute_key {
                Some(minute) => self.index.mark_minute(&date_key, &hour_key, &minute),
                None => self.index.mark_hour(&date_key, &hour_key),
            }
            inserted += 1;
        }
        info!(target: "chronolithdb::index", inserted, "index rebuilt from directory scan");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::route;
    use tempfile::TempDir;

    fn addr(dir: &Path, ts: i64, frame: Frame) -> ShardAddress {
        route(dir, ts, frame).unwrap()
    }

    // 2024-03-15T12:34:56Z
    const TS: i64 = 1_710_506_096_000;

    #[test]
    fn mark_and_contains_hour_frame() {
        let mut index = DirectoryIndex::default();
        index.mark_hour("2024_03_15", "12");
        assert!(index.contains("2024_03_15", "12", None));
        assert!(!index.contains("2024_03_15", "13", None));
        assert!(!index.contains("2024_03_15", "12", Some("00")));
    }

    #[test]
    fn mark_and_contains_minute_frame() {
        let mut index = DirectoryIndex::default();
        index.mark_minute("2024_03_15", "12", "34");
        index.mark_minute("2024_03_15", "12", "35");
        assert!(index.contains("2024_03_15", "12", Some("34")));
        assert!(index.contains("2024_03_15", "12", Some("35")));
        assert!(!index.contains("2024_03_15", "12", Some("36")));
        assert!(!index.contains("2024_03_15", "12", None));
        assert_eq!(index.shard_count(), 2);
    }

    #[test]
    fn value_form_round_trips() {
        let mut index = DirectoryIndex::default();
        index.mark_hour("2024_03_15", "12");
        index.mark_minute("2024_03_16", "01", "07");
        let value = index.to_value();
        assert_eq!(DirectoryIndex::from_value(&value).unwrap(), index);
    }

    #[test]
    fn shard_files_for_date_follow_grammar() {
        let mut index = DirectoryIndex::default();
        index.mark_minute("2024_03_15", "12", "35");
        index.mark_minute("2024_03_15", "12", "34");
        index.mark_minute("2024_03_15", "13", "00");
        assert_eq!(
            index.shard_files_for_date("2024_03_15"),
            vec![
                "2024_03_15_12_34.json",
                "2024_03_15_12_35.json",
                "2024_03_15_13_00.json"
            ]
        );
    }

    #[test]
    fn checksum_is_modular_code_unit_sum() {
        assert_eq!(payload_checksum(""), 0);
        assert_eq!(payload_checksum("{}"), ('{' as u32) + ('}' as u32));
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        manager.mark_present(&addr(dir.path(), TS, Frame::Hour));
        manager.persist().unwrap();

        let mut reopened = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        assert_eq!(reopened.load_or_recover().unwrap(), RecoverySource::Primary);
        assert!(reopened.contains("2024_03_15", "12", None));
    }

    #[test]
    fn corrupted_primary_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        manager.mark_present(&addr(dir.path(), TS, Frame::Hour));
        manager.persist().unwrap();

        // Append garbage so the envelope no longer parses.
        let primary = dir.path().join(INDEX_FILE);
        let mut text = FsAdapter::read_text(&primary).unwrap();
        text.push_str("corruption!");
        FsAdapter::write_text_truncating(&primary, &text).unwrap();

        let mut reopened = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        assert_eq!(reopened.load_or_recover().unwrap(), RecoverySource::Backup);
        assert!(reopened.contains("2024_03_15", "12", None));

        // The primary was rewritten from the backup.
        let mut again = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        assert_eq!(again.load_or_recover().unwrap(), RecoverySource::Primary);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        manager.mark_present(&addr(dir.path(), TS, Frame::Hour));
        manager.persist().unwrap();

        // Valid JSON envelope, wrong checksum: both copies tampered.
        for name in [INDEX_FILE, INDEX_BACKUP_FILE] {
            let path = dir.path().join(name);
            let envelope: Envelope =
                serde_json::from_str(&FsAdapter::read_text(&path).unwrap()).unwrap();
            let tampered = Envelope {
                index_data: envelope.index_data.replace("12", "13"),
                index_checksum: envelope.index_checksum,
            };
            FsAdapter::write_text_truncating(&path, &serde_json::to_string(&tampered).unwrap())
                .unwrap();
        }

        let mut reopened = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        assert_eq!(reopened.load_or_recover().unwrap(), RecoverySource::Fresh);
        assert!(reopened.index().is_empty());
    }

    #[test]
    fn differential_persist_skips_unchanged_index() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        manager.mark_present(&addr(dir.path(), TS, Frame::Hour));
        assert!(manager.persist_if_changed().unwrap());
        assert!(!manager.persist_if_changed().unwrap());

        manager.mark_present(&addr(dir.path(), TS + 3_600_000, Frame::Hour));
        assert!(manager.persist_if_changed().unwrap());
    }

    #[test]
    fn rebuild_from_disk_uses_the_file_grammar() {
        let dir = TempDir::new().unwrap();
        for name in [
            "2024_03_15_12.json",
            "2024_03_16_00.json",
            INDEX_FILE,
            INDEX_BACKUP_FILE,
            "notes.txt",
        ] {
            FsAdapter::write_text_truncating(&dir.path().join(name), "[]").unwrap();
        }
        let mut manager = IndexManager::new(dir.path().to_path_buf(), Frame::Hour);
        assert_eq!(manager.rebuild_from_disk().unwrap(), 2);
        assert!(manager.contains("2024_03_15", "12", None));
        assert!(manager.contains("2024_03_16", "00", None));
        assert_eq!(manager.date_keys(), vec!["2024_03_15", "2024_03_16"]);
    }
}
