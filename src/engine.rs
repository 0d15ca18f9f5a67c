//! Engine facade: lifecycle, ingest, queries, and maintenance.
//!
//! [`TimeSeriesEngine`] owns every subsystem (the directory index, the RAM
//! buffer, the query executor with its memo cache, the autosave debounce,
//! and the lazily started async write pipeline) behind a single state
//! lock. The engine is single-writer, single-reader within one process
//! instance: every mutation runs to completion under the lock before the
//! caller resumes.
//!
//! Destructive operations (`clear`, `restore`) require the literal consent
//! string `"YES"`; anything else is refused with a warning and no state is
//! touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chronolithdb_core::config::EngineConfig;
use chronolithdb_core::error::{Result, StoreError};
use chronolithdb_core::types::{Frame, Point};
use chronolithdb_pipeline::CooperativeQueue;
use chronolithdb_query::{AggregateOutput, Aggregation, QueryExecutor};
use chronolithdb_storage::{
    parse_shard_file_name, read_shard, route, write_shard, DirectoryIndex, FsAdapter,
    IndexManager, RamBuffer, INDEX_BACKUP_FILE, INDEX_FILE,
};

/// Directory that collects backup documents.
pub const BACKUP_DIRECTORY: &str = "easy_tsdb_backups";

/// Literal consent string required by `clear` and `restore`.
const CONSENT: &str = "YES";

const DATE_KEY_FORMAT: &str = "%Y_%m_%d";

/// Read-only snapshot of the engine's vitals.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub directory: PathBuf,
    pub frame: Frame,
    pub buffered_points: usize,
    pub buffered_bytes_estimate: usize,
    pub indexed_dates: usize,
    pub indexed_shards: usize,
    pub cached_queries: usize,
    pub dirty: bool,
}

/// On-disk backup document: the data directory, every shard's parsed
/// points keyed by file name, and optionally the index tree.
#[derive(Debug, Serialize, Deserialize)]
struct BackupDocument {
    database_directory: String,
    data_points: BTreeMap<String, Vec<Point>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<serde_json::Value>,
}

/// Everything mutated by engine operations, behind one lock.
struct EngineState {
    directory: PathBuf,
    frame: Frame,
    index: IndexManager,
    buffer: RamBuffer,
    executor: QueryExecutor,
    dirty: bool,
    /// Set by `clear`; makes the next flush a no-op write that still
    /// persists the (now empty) index.
    cleared: bool,
}

impl EngineState {
    fn new(directory: PathBuf, frame: Frame, index: IndexManager) -> Self {
        Self {
            executor: QueryExecutor::new(directory.clone(), frame),
            buffer: RamBuffer::new(),
            directory,
            frame,
            index,
            dirty: false,
            cleared: false,
        }
    }
}

/// Trailing-edge debounce shared with the autosave task.
struct AutosaveControl {
    deadline: Mutex<Option<tokio::time::Instant>>,
    rearmed: Arc<Notify>,
    shutdown: CancellationToken,
}

/// Embedded time-series storage engine.
///
/// Obtained from [`TimeSeriesEngine::open`]; cheap to share as an `Arc`.
/// All public operations take `&self` and serialize internally.
pub struct TimeSeriesEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    autosave: AutosaveControl,
    pipeline: OnceLock<CooperativeQueue>,
}

impl TimeSeriesEngine {
    /// Open (or create) the database under the configured directory and
    /// run the index recovery ladder. Must be called inside a Tokio
    /// runtime; the autosave task is spawned here.
    pub async fn open(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        FsAdapter::mkdir_idempotent(&config.directory)?;
        let mut index = IndexManager::new(config.directory.clone(), config.frame);
        let source = index.load_or_recover()?;
        info!(
            target: "chronolithdb::engine",
            directory = %config.directory.display(),
            frame = %config.frame,
            ?source,
            "engine opened"
        );
        let state = EngineState::new(config.directory.clone(), config.frame, index);
        let engine = Arc::new(Self {
            config,
            state: Mutex::new(state),
            autosave: AutosaveControl {
                deadline: Mutex::new(None),
                rearmed: Arc::new(Notify::new()),
                shutdown: CancellationToken::new(),
            },
            pipeline: OnceLock::new(),
        });
        Self::spawn_autosave(Arc::downgrade(&engine));
        Ok(engine)
    }

    /// The cooperative async write pipeline, started lazily on first use.
    /// Teardown order: drain the pipeline (`wait_idle`) before `close`.
    pub fn pipeline(&self) -> &CooperativeQueue {
        self.pipeline.get_or_init(CooperativeQueue::new)
    }

    /// Record a sample stamped "now".
    pub fn write_point(&self, measurement: &str, value: f64) -> Result<()> {
        self.write_point_at(measurement, value, Utc::now().timestamp_millis())
    }

    /// Record a sample with an explicit timestamp (milliseconds since
    /// epoch, UTC). Buffers in RAM, re-arms the autosave debounce, and
    /// flushes synchronously when the buffer ceiling is crossed.
    pub fn write_point_at(&self, measurement: &str, value: f64, timestamp_ms: i64) -> Result<()> {
        let overflowed = {
            let mut state = self.state.lock();
            let addr = route(&state.directory, timestamp_ms, state.frame)?;
            let estimate = state
                .buffer
                .append(&addr.path, Point::new(measurement, value, timestamp_ms));
            state.dirty = true;
            estimate > self.config.ram_ceiling_bytes
        };
        self.rearm_autosave();
        if overflowed {
            debug!(target: "chronolithdb::engine", "ram ceiling crossed, flushing");
            self.flush()?;
        }
        Ok(())
    }

    /// Migrate every buffered point to its shard file, merging with any
    /// points already on disk, then mark the index and persist it if it
    /// changed. Idempotent when the engine is neither dirty nor freshly
    /// cleared.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.cleared {
            // The post-clear flush writes nothing but must still persist
            // the emptied index.
            state.cleared = false;
            state.buffer.clear();
            state.dirty = false;
            state.index.persist_if_changed()?;
            state.executor.cache().invalidate_all();
            return Ok(());
        }
        if !state.dirty && state.buffer.is_empty() {
            return Ok(());
        }
        let drained = state.buffer.drain();
        let frame = state.frame;
        for (path, fresh) in drained {
            let mut points = match read_shard(&path) {
                Ok(points) => points,
                Err(e) => {
                    // Unreadable pre-existing shard: the merge cannot keep
                    // it, so the buffered points win and the fault is loud.
                    error!(
                        target: "chronolithdb::engine",
                        shard = %path.display(),
                        error = %e,
                        "existing shard unreadable, overwriting with buffered points"
                    );
                    Vec::new()
                }
            };
            points.extend(fresh);
            if let Err(e) = write_shard(&path, &points) {
                error!(
                    target: "chronolithdb::engine",
                    shard = %path.display(),
                    error = %e,
                    "shard write failed, points in this shard were not persisted"
                );
                continue;
            }
            Self::mark_shard_present(&mut state.index, &path, frame);
        }
        state.dirty = false;
        state.index.persist_if_changed()?;
        state.executor.cache().invalidate_all();
        debug!(target: "chronolithdb::engine", "flush complete");
        Ok(())
    }

    fn mark_shard_present(index: &mut IndexManager, path: &Path, frame: Frame) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match parse_shard_file_name(&name, frame) {
            Some((date_key, hour_key, minute_key)) => {
                let addr = chronolithdb_storage::ShardAddress {
                    date_key,
                    hour_key,
                    minute_key,
                    path: path.to_path_buf(),
                };
                index.mark_present(&addr);
            }
            None => {
                warn!(target: "chronolithdb::engine", shard = %path.display(), "shard path outside the file grammar");
            }
        }
    }

    /// Run a named aggregation over `[start, end]`. The scan is
    /// bucket-inclusive (no per-point filtering) and the result is
    /// memoized until the next mutation.
    pub fn query(&self, start_ms: i64, end_ms: i64, aggregation_key: &str) -> Result<AggregateOutput> {
        let aggregation: Aggregation = aggregation_key.parse()?;
        let state = self.state.lock();
        state.executor.query(&state.index, start_ms, end_ms, aggregation)
    }

    /// Run a caller-supplied reducer over the same bucket-inclusive scan.
    /// Memoized under the shared `custom` key; callers interleaving
    /// distinct reducers over one range should flush between them.
    pub fn query_with<F>(&self, start_ms: i64, end_ms: i64, reducer: F) -> Result<AggregateOutput>
    where
        F: FnOnce(&[Point]) -> AggregateOutput,
    {
        let state = self.state.lock();
        state.executor.query_custom(&state.index, start_ms, end_ms, reducer)
    }

    /// The raw concatenated point sequence for a range, in scan order.
    /// Callers needing strict point-wise bounds filter on
    /// `Point::timestamp` themselves.
    pub fn retrieve_data_series(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Point>> {
        let state = self.state.lock();
        state.executor.scan(&state.index, start_ms, end_ms)
    }

    /// Remove every shard of every indexed date strictly older than the
    /// threshold. Returns the number of dates dropped; the index is
    /// persisted (both copies) whenever anything was dropped.
    pub fn purge(&self, older_than_ms: i64) -> Result<usize> {
        let threshold = chrono::DateTime::from_timestamp_millis(older_than_ms)
            .ok_or_else(|| StoreError::Parse {
                path: String::new(),
                detail: format!("timestamp {older_than_ms} is outside the representable range"),
            })?
            .date_naive();
        let mut state = self.state.lock();
        let mut dropped = 0;
        for date_key in state.index.date_keys() {
            let Ok(date) = NaiveDate::parse_from_str(&date_key, DATE_KEY_FORMAT) else {
                warn!(target: "chronolithdb::engine", date_key, "unparsable date key in index");
                continue;
            };
            if date >= threshold {
                continue;
            }
            for file in state.index.index().shard_files_for_date(&date_key) {
                let path = state.directory.join(&file);
                match FsAdapter::remove(&path) {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                    Err(e) => {
                        error!(target: "chronolithdb::engine", shard = %path.display(), error = %e, "purge could not remove shard");
                    }
                }
            }
            state.index.drop_date(&date_key);
            dropped += 1;
            info!(target: "chronolithdb::engine", date_key, "purged date");
        }
        if dropped > 0 {
            state.index.persist()?;
            state.executor.cache().invalidate_all();
        }
        Ok(dropped)
    }

    /// Delete every file under the data directory (the index envelopes
    /// included), reset all in-memory state, and arm the `dbcleared`
    /// sentinel. Requires the literal consent string `"YES"`.
    pub fn clear(&self, consent: &str) -> Result<()> {
        if consent != CONSENT {
            warn!(target: "chronolithdb::engine", "clear refused: consent string mismatch");
            return Err(StoreError::InvalidConsent);
        }
        self.disarm_autosave();
        let mut state = self.state.lock();
        let names = match FsAdapter::list(&state.directory) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        for name in names {
            let path = state.directory.join(&name);
            match FsAdapter::remove(&path) {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => {
                    error!(target: "chronolithdb::engine", path = %path.display(), error = %e, "clear could not remove file");
                }
            }
        }
        state.buffer.clear();
        state.index.reset();
        state.executor.cache().invalidate_all();
        state.dirty = false;
        state.cleared = true;
        info!(target: "chronolithdb::engine", directory = %state.directory.display(), "database cleared");
        Ok(())
    }

    /// Flush pending state if needed, stop the autosave task, and persist
    /// the index if it changed. Drain the pipeline (`wait_idle`) before
    /// calling this when async writes are in flight.
    pub fn close(&self) -> Result<()> {
        let needs_flush = {
            let state = self.state.lock();
            state.dirty || state.cleared
        };
        if needs_flush {
            self.flush()?;
        }
        self.disarm_autosave();
        self.autosave.shutdown.cancel();
        let mut state = self.state.lock();
        state.index.persist_if_changed()?;
        info!(target: "chronolithdb::engine", "engine closed");
        Ok(())
    }

    /// Write a pretty-printed backup document under
    /// `easy_tsdb_backups/<name>.json`: the data directory, every shard's
    /// parsed points, and optionally the index. The index envelopes are
    /// never included as shards. Returns the backup path.
    pub fn backup(&self, name: &str, include_index: bool) -> Result<PathBuf> {
        let file_name = if name.ends_with(".json") {
            name.to_string()
        } else {
            format!("{name}.json")
        };
        // A bare name lands in the backups directory; an explicit path is
        // honored as given.
        let target = if Path::new(&file_name).components().count() > 1 {
            PathBuf::from(file_name)
        } else {
            PathBuf::from(BACKUP_DIRECTORY).join(file_name)
        };
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                FsAdapter::mkdir_idempotent(parent)?;
            }
        }

        let state = self.state.lock();
        let mut data_points = BTreeMap::new();
        let names = match FsAdapter::list(&state.directory) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        for name in names {
            if name == INDEX_FILE || name == INDEX_BACKUP_FILE {
                continue;
            }
            let path = state.directory.join(&name);
            match read_shard(&path) {
                Ok(points) => {
                    data_points.insert(name, points);
                }
                Err(e) => {
                    warn!(target: "chronolithdb::engine", shard = %path.display(), error = %e, "backup skipping unreadable shard");
                }
            }
        }
        let document = BackupDocument {
            database_directory: state.directory.display().to_string(),
            data_points,
            index: include_index.then(|| state.index.index().to_value()),
        };
        let text = serde_json::to_string_pretty(&document)
            .map_err(|e| StoreError::parse(&target, e.to_string()))?;
        FsAdapter::write_text_truncating(&target, &text)?;
        info!(target: "chronolithdb::engine", backup = %target.display(), "backup written");
        Ok(target)
    }

    /// Replace the database with the contents of a backup document:
    /// adopts its data directory, clears the current state, rewrites every
    /// shard, and either adopts the embedded index verbatim or rebuilds it
    /// from the directory scan. Requires consent.
    pub fn restore(&self, consent: &str, backup_path: &Path, recalculate_index: bool) -> Result<()> {
        if consent != CONSENT {
            warn!(target: "chronolithdb::engine", "restore refused: consent string mismatch");
            return Err(StoreError::InvalidConsent);
        }
        let text = FsAdapter::read_text(backup_path)?;
        let document: BackupDocument = serde_json::from_str(&text)
            .map_err(|e| StoreError::parse(backup_path, e.to_string()))?;

        self.clear(CONSENT)?;

        let mut state = self.state.lock();
        let directory = PathBuf::from(&document.database_directory);
        FsAdapter::mkdir_idempotent(&directory)?;
        if directory != state.directory {
            info!(
                target: "chronolithdb::engine",
                from = %state.directory.display(),
                to = %directory.display(),
                "restore adopting database directory"
            );
            state.directory = directory.clone();
            state.index = IndexManager::new(directory.clone(), state.frame);
            state.executor = QueryExecutor::new(directory.clone(), state.frame);
        }
        for (name, points) in &document.data_points {
            write_shard(&state.directory.join(name), points)?;
        }
        match (&document.index, recalculate_index) {
            (Some(index_value), false) => {
                let index = DirectoryIndex::from_value(index_value)
                    .map_err(|detail| StoreError::parse(backup_path, detail))?;
                state.index.adopt(index);
            }
            _ => {
                state.index.rebuild_from_disk()?;
            }
        }
        state.index.persist()?;
        state.executor.cache().invalidate_all();
        state.cleared = false;
        state.dirty = false;
        info!(target: "chronolithdb::engine", backup = %backup_path.display(), "restore complete");
        Ok(())
    }

    /// Vitals snapshot for monitoring.
    pub fn database_stats(&self) -> DatabaseStats {
        let state = self.state.lock();
        DatabaseStats {
            directory: state.directory.clone(),
            frame: state.frame,
            buffered_points: state.buffer.point_count(),
            buffered_bytes_estimate: state.buffer.estimated_bytes(),
            indexed_dates: state.index.date_keys().len(),
            indexed_shards: state.index.index().shard_count(),
            cached_queries: state.executor.cache().len(),
            dirty: state.dirty,
        }
    }

    fn rearm_autosave(&self) {
        let deadline = tokio::time::Instant::now() + self.config.autosave_interval;
        *self.autosave.deadline.lock() = Some(deadline);
        self.autosave.rearmed.notify_one();
    }

    fn disarm_autosave(&self) {
        *self.autosave.deadline.lock() = None;
        self.autosave.rearmed.notify_one();
    }

    /// Trailing-edge debounce loop: sleep toward the current deadline and
    /// flush when it fires with no further writes. Holds only a weak
    /// reference so a dropped engine tears the task down.
    fn spawn_autosave(engine: Weak<TimeSeriesEngine>) {
        tokio::spawn(async move {
            loop {
                let (deadline, rearmed, shutdown) = {
                    let Some(strong) = engine.upgrade() else {
                        return;
                    };
                    let result = (
                        *strong.autosave.deadline.lock(),
                        Arc::clone(&strong.autosave.rearmed),
                        strong.autosave.shutdown.clone(),
                    );
                    result
                };
                match deadline {
                    None => {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = rearmed.notified() => {}
                        }
                    }
                    Some(at) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = rearmed.notified() => {}
                            _ = tokio::time::sleep_until(at) => {
                                let Some(strong) = engine.upgrade() else {
                                    return;
                                };
                                let fire = {
                                    let mut slot = strong.autosave.deadline.lock();
                                    if *slot == Some(at) {
                                        *slot = None;
                                        true
                                    } else {
                                        false
                                    }
                                };
                                if fire {
                                    debug!(target: "chronolithdb::engine", "autosave firing");
                                    if let Err(e) = strong.flush() {
                                        error!(target: "chronolithdb::engine", error = %e, "autosave flush failed");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}
