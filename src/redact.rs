//! Size-triggered redaction of POST form values.
//!
//! The request dump is split at the blank line between head and body. When
//! the body is a form, every field whose value is longer than the threshold
//! is replaced by `md5-<field>=<hex digest>` and the original value goes to
//! the redaction store. Anything that does not look like a form passes
//! through untouched.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use md5::{Digest, Md5};
use tracing::warn;

use crate::sink::{RedactionEntry, RedactionSink};

/// Values longer than this many bytes are redacted.
pub const DEFAULT_THRESHOLD: usize = 1000;

const HEAD_BODY_SEPARATOR: &str = "\r\n\r\n";

/// Lowercase hex MD5 digest of `value`.
pub fn md5_hex(value: &str) -> String {
    hex::encode(Md5::digest(value.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct Redactor {
    sink: Arc<dyn RedactionSink>,
    threshold: usize,
}

impl Redactor {
    pub fn new(sink: Arc<dyn RedactionSink>) -> Self {
        Self {
            sink,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Redacts oversized form fields in a serialized request.
    ///
    /// Returns the input unchanged when it has no single head/body split,
    /// when the body is not form encoded, or when no field is over the
    /// threshold.
    pub fn redact<'a>(&self, dump: &'a str) -> Cow<'a, str> {
        let mut parts = dump.split(HEAD_BODY_SEPARATOR);
        let (Some(head), Some(body), None) = (parts.next(), parts.next(), parts.next()) else {
            return Cow::Borrowed(dump);
        };
        let Some(fields) = parse_form(body) else {
            return Cow::Borrowed(dump);
        };
        if fields.values().all(|value| value.len() <= self.threshold) {
            return Cow::Borrowed(dump);
        }

        let mut redacted = BTreeMap::new();
        for (field, value) in fields {
            if value.len() > self.threshold {
                let hash = md5_hex(&value);
                let entry = RedactionEntry {
                    field: field.clone(),
                    hash: hash.clone(),
                    content: value,
                };
                if let Err(err) = self.sink.append(&entry) {
                    warn!(field = %entry.field, error = %err, "Failed to store redacted value");
                }
                redacted.insert(format!("md5-{field}"), hash);
            } else {
                redacted.insert(field, value);
            }
        }

        let pairs: Vec<(String, String)> = redacted.into_iter().collect();
        match serde_urlencoded::to_string(&pairs) {
            Ok(encoded) => Cow::Owned(format!("{head}{HEAD_BODY_SEPARATOR}{encoded}")),
            Err(err) => {
                warn!(error = %err, "Failed to re-encode redacted form");
                Cow::Borrowed(dump)
            }
        }
    }
}

/// Parses a form body, keeping the first value of each key. Bodies with
/// malformed percent escapes or `;` separators are not treated as forms.
fn parse_form(body: &str) -> Option<BTreeMap<String, String>> {
    if body.contains(';') || !has_valid_escapes(body) {
        return None;
    }
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(body).ok()?;
    let mut fields = BTreeMap::new();
    for (key, value) in pairs {
        fields.entry(key).or_insert(value);
    }
    Some(fields)
}

fn has_valid_escapes(body: &str) -> bool {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}
