//! Log and redaction destinations.
//!
//! Both streams are rolling files, rotated daily or hourly, written from a
//! background thread through `tracing_appender::non_blocking`. Opening the
//! log stream never fails: when the directory is unusable the stream falls
//! back to stdout. The redaction store is optional; when it cannot be opened
//! redaction is simply switched off.
//!
//! File names are `<prefix>.<date>.log`, the date being `YYYY-MM-DD` or
//! `YYYY-MM-DD-HH` depending on the rotation.

use std::{
    fmt,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::{
    non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};

use crate::{config::SplitBy, error::SinkError, logger::LogWriter};

/// File name prefix of the request log stream.
pub const LOG_FILE_PREFIX: &str = "zlog";

/// File name prefix of the redaction store.
pub const HASH_FILE_PREFIX: &str = "hash";

/// One oversized form value taken out of the request log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionEntry {
    pub field: String,
    #[serde(rename = "md5")]
    pub hash: String,
    pub content: String,
}

/// Append-only store for redacted values. Implementations must keep
/// concurrent appends from interleaving within one record.
pub trait RedactionSink: fmt::Debug + Send + Sync {
    fn append(&self, entry: &RedactionEntry) -> Result<(), SinkError>;
}

/// Opens a rolling file appender under `dir`, creating the directory.
pub fn rolling_appender(
    dir: &Path,
    prefix: &str,
    split_by: SplitBy,
) -> Result<RollingFileAppender, SinkError> {
    std::fs::create_dir_all(dir).map_err(|source| SinkError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let rotation = match split_by {
        SplitBy::Day => Rotation::DAILY,
        SplitBy::Hour => Rotation::HOURLY,
    };

    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .map_err(|source| SinkError::Open {
            path: dir.to_path_buf(),
            source,
        })
}

/// Moves writes to `writer` onto a worker thread. Lines are never dropped;
/// a full queue blocks the writer instead. Pending lines are flushed when
/// the guard is dropped.
pub fn background(writer: impl Write + Send + 'static) -> (NonBlocking, WorkerGuard) {
    NonBlockingBuilder::default().lossy(false).finish(writer)
}

/// Opens the request log stream, falling back to stdout. Keep the guard
/// for as long as the writer is in use.
pub fn open_log_writer(dir: &Path, split_by: SplitBy) -> (LogWriter, WorkerGuard) {
    let (writer, guard) = match rolling_appender(dir, LOG_FILE_PREFIX, split_by) {
        Ok(appender) => {
            info!(dir = %dir.display(), %split_by, "Request log opened");
            background(appender)
        }
        Err(err) => {
            warn!(error = %err, "Request log unavailable, logging to stdout");
            background(io::stdout())
        }
    };
    (LogWriter::new(writer), guard)
}

/// Redaction store backed by rolling files, one JSON object per line.
/// Entries still queued are flushed when the store is dropped.
#[derive(Debug)]
pub struct FileRedactionSink {
    writer: LogWriter,
    _guard: WorkerGuard,
}

impl FileRedactionSink {
    pub fn open(dir: &Path, split_by: SplitBy) -> Result<Self, SinkError> {
        let appender = rolling_appender(dir, HASH_FILE_PREFIX, split_by)?;
        let (writer, guard) = background(appender);
        Ok(Self {
            writer: LogWriter::new(writer),
            _guard: guard,
        })
    }

    /// Opens the store, or returns `None` and disables redaction on failure.
    pub fn open_optional(dir: &Path, split_by: SplitBy) -> Option<Arc<dyn RedactionSink>> {
        match Self::open(dir, split_by) {
            Ok(sink) => {
                info!(dir = %dir.display(), %split_by, "Redaction store opened");
                Some(Arc::new(sink))
            }
            Err(err) => {
                warn!(error = %err, "Redaction store unavailable, redaction disabled");
                None
            }
        }
    }
}

impl RedactionSink for FileRedactionSink {
    fn append(&self, entry: &RedactionEntry) -> Result<(), SinkError> {
        let line = serde_json::to_vec(entry)?;
        self.writer.write_line(line)?;
        Ok(())
    }
}

/// Redaction store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRedactionSink {
    entries: Mutex<Vec<RedactionEntry>>,
}

impl MemoryRedactionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RedactionEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RedactionSink for MemoryRedactionSink {
    fn append(&self, entry: &RedactionEntry) -> Result<(), SinkError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}
