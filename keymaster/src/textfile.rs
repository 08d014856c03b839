//! Human-editable, line-per-record text format used inside sealed files:
//!
//! ```text
//! # comments and blank lines are ignored
//! "h1:alice": {"versionTag":"v2","hostname":"h1",...}
//! ```
//!
//! Both the key and the record are parsed with serde, so loading a file can
//! only ever produce typed values.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TextFileError {
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("line {line}: duplicate key {key:?}")]
    DuplicateKey { line: usize, key: String },
    #[error("serialize failed: {0}")]
    Serialize(String),
}

/// Renders one `"key": record` line per entry, sorted by key.
pub fn encode_lines<T: Serialize>(entries: &BTreeMap<String, T>) -> Result<String, TextFileError> {
    let mut out = String::new();
    for (key, record) in entries {
        let key = serde_json::to_string(key).map_err(|e| TextFileError::Serialize(format!("{e}")))?;
        let record =
            serde_json::to_string(record).map_err(|e| TextFileError::Serialize(format!("{e}")))?;
        out.push_str(&key);
        out.push_str(": ");
        out.push_str(&record);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_lines<T: DeserializeOwned>(text: &str) -> Result<BTreeMap<String, T>, TextFileError> {
    let mut entries = BTreeMap::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, record) = decode_line(trimmed).map_err(|reason| TextFileError::Parse { line, reason })?;
        if entries.contains_key(&key) {
            return Err(TextFileError::DuplicateKey { line, key });
        }
        entries.insert(key, record);
    }
    Ok(entries)
}

fn decode_line<T: DeserializeOwned>(line: &str) -> Result<(String, T), String> {
    let mut stream = serde_json::Deserializer::from_str(line).into_iter::<String>();
    let key = match stream.next() {
        Some(Ok(key)) => key,
        Some(Err(e)) => return Err(format!("invalid key: {e}")),
        None => return Err("missing key".to_string()),
    };
    let rest = line[stream.byte_offset()..].trim_start();
    let Some(rest) = rest.strip_prefix(':') else {
        return Err("expected ':' after key".to_string());
    };
    let record = serde_json::from_str(rest).map_err(|e| format!("invalid record: {e}"))?;
    Ok((key, record))
}
