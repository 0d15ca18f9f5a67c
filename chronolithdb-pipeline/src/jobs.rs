//! Cooperative file jobs.
//!
//! The concrete [`QueueJob`] implementations behind the pipeline's public
//! surface: a chunked streaming write, an incremental streaming read with
//! the legacy-blob fallback, and a chunked file copy. Every job owns its
//! file handles and releases them on every exit path (completion, error,
//! and abandonment alike) and reports its outcome through a oneshot
//! channel; a dropped channel is how submitters observe cancellation.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::warn;

use chronolithdb_core::error::{Result, StoreError};

use crate::codec::{decode_text, DecodeState, EncodeState};
use crate::queue::{CooperativeQueue, QueueJob, SliceOutcome};

/// Parsed records per read slice before yielding.
const READ_RECORDS_PER_SLICE: usize = 5;

/// Bytes moved per copy step; the deadline is checked between steps.
const COPY_CHUNK_BYTES: usize = 4096;

/// Streams one logical object into a file in the line-delimited wire form,
/// ~512 bytes at a time.
pub struct StreamWriteJob {
    path: PathBuf,
    state: EncodeState,
    writer: Option<BufWriter<File>>,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl StreamWriteJob {
    pub fn new(
        path: PathBuf,
        object: &Map<String, Value>,
    ) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let state = EncodeState::new(object)?;
        let (tx, rx) = oneshot::channel();
        Ok((
            Self {
                path,
                state,
                writer: None,
                done: Some(tx),
            },
            rx,
        ))
    }

    fn finish(&mut self, result: Result<()>) -> SliceOutcome {
        self.writer = None;
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
        SliceOutcome::Complete
    }

    fn step(&mut self, deadline: Instant) -> Result<bool> {
        if self.writer.is_none() {
            let file =
                File::create(&self.path).map_err(|e| StoreError::from_io(&self.path, e))?;
            self.writer = Some(BufWriter::new(file));
        }
        while Instant::now() < deadline {
            match self.state.next_chunk()? {
                Some(chunk) => {
                    if let Some(writer) = self.writer.as_mut() {
                        writer
                            .write_all(chunk.as_bytes())
                            .map_err(|e| StoreError::from_io(&self.path, e))?;
                    }
                }
                None => {
                    if let Some(mut writer) = self.writer.take() {
                        writer
                            .flush()
                            .map_err(|e| StoreError::from_io(&self.path, e))?;
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl QueueJob for StreamWriteJob {
    fn tick(&mut self, deadline: Instant) -> SliceOutcome {
        match self.step(deadline) {
            Ok(true) => self.finish(Ok(())),
            Ok(false) => SliceOutcome::Yielded,
            Err(e) => {
                warn!(target: "chronolithdb::pipeline", path = %self.path.display(), error = %e, "stream write failed");
                self.finish(Err(e))
            }
        }
    }

    fn label(&self) -> &'static str {
        "stream-write"
    }
}

enum ReadPhase {
    Opening,
    Streaming {
        lines: std::io::Lines<BufReader<File>>,
        state: DecodeState,
    },
}

/// Incrementally reassembles a logical object from a file, parsing at most
/// a few records per slice. A file that does not open with a meta record
/// is treated as a legacy single-object blob and parsed whole.
pub struct StreamReadJob {
    path: PathBuf,
    phase: ReadPhase,
    done: Option<oneshot::Sender<Result<Value>>>,
}

impl StreamReadJob {
    pub fn new(path: PathBuf) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                path,
                phase: ReadPhase::Opening,
                done: Some(tx),
            },
            rx,
        )
    }

    fn finish(&mut self, result: Result<Value>) -> SliceOutcome {
        self.phase = ReadPhase::Opening;
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
        SliceOutcome::Complete
    }

    fn open(&mut self) -> Result<Option<Value>> {
        let file = File::open(&self.path).map_err(|e| StoreError::from_io(&self.path, e))?;
        let mut lines = BufReader::new(file).lines();
        let first = loop {
            match lines.next() {
                Some(line) => {
                    let line = line.map_err(|e| StoreError::from_io(&self.path, e))?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => {
                    return Err(StoreError::parse(&self.path, "empty input"));
                }
            }
        };
        let sniffed_meta = serde_json::from_str::<Value>(first.trim())
            .ok()
            .map(|v| v.get("T") == Some(&Value::String("meta".into())))
            .unwrap_or(false);
        if sniffed_meta {
            let mut state = DecodeState::new();
            state
                .feed_line(&first)
                .map_err(|e| StoreError::parse(&self.path, e.to_string()))?;
            self.phase = ReadPhase::Streaming { lines, state };
            return Ok(None);
        }
        // Legacy fallback: the rest of the file is part of one JSON blob.
        let mut text = first;
        for line in lines {
            let line = line.map_err(|e| StoreError::from_io(&self.path, e))?;
            text.push('\n');
            text.push_str(&line);
        }
        let value =
            decode_text(&text).map_err(|e| StoreError::parse(&self.path, e.to_string()))?;
        Ok(Some(value))
    }

    fn step(&mut self, deadline: Instant) -> Result<Option<Value>> {
        if matches!(self.phase, ReadPhase::Opening) {
            if let Some(legacy) = self.open()? {
                return Ok(Some(legacy));
            }
            return Ok(None); // streaming set up; parse records next slice
        }
        let ReadPhase::Streaming { lines, state } = &mut self.phase else {
            return Err(StoreError::parse(&self.path, "read job in invalid phase"));
        };
        for _ in 0..READ_RECORDS_PER_SLICE {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match lines.next() {
                Some(line) => {
                    let line = line.map_err(|e| StoreError::from_io(&self.path, e))?;
                    state
                        .feed_line(&line)
                        .map_err(|e| StoreError::parse(&self.path, e.to_string()))?;
                }
                None => {
                    let state = std::mem::take(state);
                    let value = state
                        .finish()
                        .map_err(|e| StoreError::parse(&self.path, e.to_string()))?;
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }
}

impl QueueJob for StreamReadJob {
    fn tick(&mut self, deadline: Instant) -> SliceOutcome {
        match self.step(deadline) {
            Ok(Some(value)) => self.finish(Ok(value)),
            Ok(None) => SliceOutcome::Yielded,
            Err(e) => {
                warn!(target: "chronolithdb::pipeline", path = %self.path.display(), error = %e, "stream read failed");
                self.finish(Err(e))
            }
        }
    }

    fn label(&self) -> &'static str {
        "stream-read"
    }
}

/// Copies a file in small chunks, yielding between chunks, and reports the
/// number of bytes moved.
pub struct CopyJob {
    src: PathBuf,
    dst: PathBuf,
    reader: Option<BufReader<File>>,
    writer: Option<BufWriter<File>>,
    copied: u64,
    done: Option<oneshot::Sender<Result<u64>>>,
}

impl CopyJob {
    pub fn new(src: PathBuf, dst: PathBuf) -> (Self, oneshot::Receiver<Result<u64>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                src,
                dst,
                reader: None,
                writer: None,
                copied: 0,
                done: Some(tx),
            },
            rx,
        )
    }

    fn finish(&mut self, result: Result<u64>) -> SliceOutcome {
        self.reader = None;
        self.writer = None;
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
        SliceOutcome::Complete
    }

    fn step(&mut self, deadline: Instant) -> Result<Option<u64>> {
        if self.reader.is_none() {
            let src = File::open(&self.src).map_err(|e| StoreError::from_io(&self.src, e))?;
            let dst =
                File::create(&self.dst).map_err(|e| StoreError::from_io(&self.dst, e))?;
            self.reader = Some(BufReader::new(src));
            self.writer = Some(BufWriter::new(dst));
        }
        let mut chunk = [0u8; COPY_CHUNK_BYTES];
        while Instant::now() < deadline {
            let (Some(reader), Some(writer)) = (self.reader.as_mut(), self.writer.as_mut())
            else {
                return Err(StoreError::parse(&self.src, "copy job in invalid phase"));
            };
            let read = reader
                .read(&mut chunk)
                .map_err(|e| StoreError::from_io(&self.src, e))?;
            if read == 0 {
                if let Some(mut writer) = self.writer.take() {
                    writer.flush().map_err(|e| StoreError::from_io(&self.dst, e))?;
                }
                return Ok(Some(self.copied));
            }
            writer
                .write_all(&chunk[..read])
                .map_err(|e| StoreError::from_io(&self.dst, e))?;
            self.copied += read as u64;
        }
        Ok(None)
    }
}

impl QueueJob for CopyJob {
    fn tick(&mut self, deadline: Instant) -> SliceOutcome {
        match self.step(deadline) {
            Ok(Some(copied)) => self.finish(Ok(copied)),
            Ok(None) => SliceOutcome::Yielded,
            Err(e) => {
                warn!(target: "chronolithdb::pipeline", src = %self.src.display(), error = %e, "copy failed");
                self.finish(Err(e))
            }
        }
    }

    fn label(&self) -> &'static str {
        "copy"
    }
}

impl CooperativeQueue {
    /// Queue a streaming write of `object` to `path`. The returned channel
    /// resolves when the job completes; it is dropped if the job is
    /// abandoned by a reset or emergency stop.
    pub fn write_object(
        &self,
        path: PathBuf,
        object: &Map<String, Value>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (job, rx) = StreamWriteJob::new(path, object)?;
        self.enqueue(Box::new(job));
        Ok(rx)
    }

    /// Queue a streaming read of `path` (either wire form).
    pub fn read_object(&self, path: PathBuf) -> oneshot::Receiver<Result<Value>> {
        let (job, rx) = StreamReadJob::new(path);
        self.enqueue(Box::new(job));
        rx
    }

    /// Queue a chunked copy of `src` to `dst`.
    pub fn copy_file(&self, src: PathBuf, dst: PathBuf) -> oneshot::Receiver<Result<u64>> {
        let (job, rx) = CopyJob::new(src, dst);
        self.enqueue(Box::new(job));
        rx
    }
}
