//! JSON-lines request logger.
//!
//! A [`Logger`] is built once at startup with its destination and static
//! fields (`service`, `host`). Every request gets its own [`ContextLogger`],
//! a clone of the base logger plus a set of fields accumulated as the request
//! moves through the chain. Each emitted event is written as one JSON object
//! per line.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{Level, warn};

/// A typed log field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Str(s) => Value::String(s),
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Int(i) => Value::from(i),
            FieldValue::Uint(u) => Value::from(u),
            // non-finite floats become null
            FieldValue::Float(f) => Value::from(f),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

/// Ordered key/value fields, unique by key. Setting an existing key replaces
/// its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: FieldValue) -> &mut Self {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn str(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key, FieldValue::Str(value.into()))
    }

    pub fn bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, FieldValue::Bool(value))
    }

    pub fn int(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.set(key, FieldValue::Int(value))
    }

    pub fn uint(&mut self, key: impl Into<String>, value: u64) -> &mut Self {
        self.set(key, FieldValue::Uint(value))
    }

    pub fn float(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.set(key, FieldValue::Float(value))
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn write_into(&self, map: &mut Map<String, Value>) {
        for (key, value) in &self.entries {
            map.insert(key.clone(), value.clone().into());
        }
    }
}

/// Shared, line-atomic destination for log records.
///
/// Each record goes out as a single write of the full line, newline
/// included, so concurrent requests never interleave within a record. File
/// destinations sit behind `tracing_appender::non_blocking`, which makes that
/// write a channel send.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Appends the newline and writes `line` in one call.
    pub fn write_line(&self, mut line: Vec<u8>) -> io::Result<()> {
        line.push(b'\n');
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.write_all(&line)?;
        guard.flush()
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

/// In-memory writer, handy for inspecting emitted records.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Parses every line written so far. Lines that are not JSON are skipped.
    pub fn records(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Process-wide base logger. Read-only once built.
#[derive(Debug, Clone)]
pub struct Logger {
    writer: LogWriter,
    fields: Arc<Fields>,
    max_level: Level,
}

impl Logger {
    pub fn new(writer: LogWriter) -> Self {
        Self {
            writer,
            fields: Arc::new(Fields::new()),
            max_level: Level::TRACE,
        }
    }

    /// Adds a static field carried by every record.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Arc::make_mut(&mut self.fields).set(key, value.into());
        self
    }

    /// Drops events more verbose than `level`.
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }

    /// Clones the base logger for one request.
    pub fn for_request(&self) -> ContextLogger {
        ContextLogger {
            base: self.clone(),
            fields: Fields::new(),
        }
    }
}

/// A request's own logger: the base logger plus accumulated fields.
#[derive(Debug, Clone)]
pub struct ContextLogger {
    base: Logger,
    fields: Fields,
}

impl ContextLogger {
    /// Applies `f` to the accumulated fields.
    pub fn update_context(&mut self, f: impl FnOnce(&mut Fields)) {
        f(&mut self.fields);
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.base.max_level
    }

    pub fn event(&self, level: Level) -> Event<'_> {
        Event {
            logger: self,
            level,
            fields: Fields::new(),
        }
    }

    pub fn debug(&self) -> Event<'_> {
        self.event(Level::DEBUG)
    }

    pub fn info(&self) -> Event<'_> {
        self.event(Level::INFO)
    }
}

/// One pending log record. Written by [`Event::msg`].
#[must_use = "an event is only written when `msg` is called"]
pub struct Event<'a> {
    logger: &'a ContextLogger,
    level: Level,
    fields: Fields,
}

impl Event<'_> {
    pub fn str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.str(key, value);
        self
    }

    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.fields.int(key, value);
        self
    }

    pub fn uint(mut self, key: &str, value: u64) -> Self {
        self.fields.uint(key, value);
        self
    }

    pub fn float(mut self, key: &str, value: f64) -> Self {
        self.fields.float(key, value);
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.set(key, value);
        self
    }

    pub fn msg(self, message: &str) {
        if !self.logger.enabled(self.level) {
            return;
        }
        let record = self.to_record(message);
        let line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "Failed to encode log record");
                return;
            }
        };
        if let Err(err) = self.logger.base.writer.write_line(line) {
            warn!(error = %err, "Failed to write log record");
        }
    }

    fn to_record(&self, message: &str) -> Value {
        let mut map = Map::new();
        map.insert(
            "level".into(),
            Value::String(self.level.as_str().to_ascii_lowercase()),
        );
        map.insert(
            "time".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        self.logger.base.fields.write_into(&mut map);
        self.logger.fields.write_into(&mut map);
        self.fields.write_into(&mut map);
        if !message.is_empty() {
            map.insert("message".into(), Value::String(message.to_string()));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(writer: &MemoryWriter) -> Logger {
        Logger::new(LogWriter::new(writer.clone()))
            .with_field("service", "zlog-test")
            .with_field("host", "box-1")
    }

    #[test]
    fn test_fields_last_write_wins() {
        let mut fields = Fields::new();
        fields.str("a", "1").int("b", 2).str("a", "3");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("a"), Some(&FieldValue::Str("3".into())));
        let keys: Vec<_> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_record_shape() {
        let writer = MemoryWriter::new();
        let mut logger = base(&writer).for_request();
        logger.update_context(|c| {
            c.str("req_id", "abc");
        });
        logger.debug().uint("status", 200).float("duration", 1.5).msg("");

        let records = writer.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["level"], "debug");
        assert_eq!(record["service"], "zlog-test");
        assert_eq!(record["host"], "box-1");
        assert_eq!(record["req_id"], "abc");
        assert_eq!(record["status"], 200);
        assert_eq!(record["duration"], 1.5);
        assert!(record["time"].is_string());
        assert!(record.get("message").is_none());
    }

    #[test]
    fn test_request_loggers_are_isolated() {
        let writer = MemoryWriter::new();
        let logger = base(&writer);
        let mut first = logger.for_request();
        let second = logger.for_request();
        first.update_context(|c| {
            c.str("only_first", "x");
        });
        assert!(first.fields().get("only_first").is_some());
        assert!(second.fields().get("only_first").is_none());
    }

    /// Keeps every `write` call separately.
    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Write for Calls {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_each_record_is_one_write() {
        let calls = Calls::default();
        let logger = Logger::new(LogWriter::new(calls.clone())).for_request();
        logger.info().str("a", "1").msg("first");
        logger.info().str("a", "2").msg("second");

        let calls = calls.0.lock().unwrap();
        assert_eq!(calls.len(), 2);
        for call in calls.iter() {
            assert_eq!(call.last(), Some(&b'\n'));
            let record: Value = serde_json::from_slice(call).unwrap();
            assert_eq!(record["level"], "info");
        }
    }

    #[test]
    fn test_max_level_filters_events() {
        let writer = MemoryWriter::new();
        let logger = base(&writer).with_max_level(Level::INFO).for_request();
        logger.debug().msg("dropped");
        logger.info().msg("kept");
        let records = writer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "kept");
    }
}
