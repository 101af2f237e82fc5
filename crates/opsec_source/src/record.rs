//! Conversion of fw1-loggrabber lines into JSON records.
//!
//! fw1-loggrabber prints one audit entry per line as `key=value` pairs separated by `|`:
//!
//! ```text
//! time=17Apr2015  8:10:16|action=accept|orig=localhost|i/f_dir=inbound
//! ```
//!
//! A `|` preceded by a backslash belongs to the value and is kept verbatim, backslash included.

use std::{collections::BTreeMap, time::Instant};

use crate::metrics::{MetricsEvent, MetricsSink};

const FIELD_SEPARATOR: char = '|';
const ESCAPE: char = '\\';
const KEY_VALUE_SEPARATOR: char = '=';

/// Field name to value, ordered by field name.
pub type FieldMap = BTreeMap<String, String>;

/// Splits `line` on every `|` that is not directly preceded by `\`.
pub fn split_entries(line: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut start = 0;
    let mut previous = None;
    for (idx, ch) in line.char_indices() {
        if ch == FIELD_SEPARATOR && previous != Some(ESCAPE) {
            entries.push(&line[start..idx]);
            start = idx + ch.len_utf8();
        }
        previous = Some(ch);
    }
    entries.push(&line[start..]);
    entries
}

/// Splits one field entry into its name and value.
///
/// Only the first two `=`-separated parts are kept and trailing empty parts are ignored, so
/// `key=` and `key` both yield an empty value and `a=b=c` yields `("a", "b")`.
pub fn split_key_value(entry: &str) -> (&str, &str) {
    let mut parts: Vec<&str> = entry.split(KEY_VALUE_SEPARATOR).collect();
    while parts.last().is_some_and(|part| part.is_empty()) {
        parts.pop();
    }
    match parts.as_slice() {
        [] => ("", ""),
        [key] => (*key, ""),
        [key, value, ..] => (*key, *value),
    }
}

/// Builds the field mapping for one line. Later duplicates overwrite earlier ones.
pub fn parse_fields(line: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    if line.is_empty() {
        return fields;
    }
    for entry in split_entries(line) {
        let (key, value) = split_key_value(entry);
        fields.insert(key.to_string(), value.to_string());
    }
    fields
}

/// Serializes the line as a compact JSON object with members in key order.
///
/// Every call reports a [`MetricsEvent::ProcessingDuration`], including the fast path for an
/// empty or absent line, which returns `{}`.
pub fn encode_record(
    line: Option<&str>,
    metrics: &dyn MetricsSink,
) -> Result<Vec<u8>, serde_json::Error> {
    let started = Instant::now();
    let encoded = match line {
        None | Some("") => Ok(b"{}".to_vec()),
        Some(line) => serde_json::to_vec(&parse_fields(line)),
    };
    metrics.record(MetricsEvent::ProcessingDuration(started.elapsed()));
    encoded
}
