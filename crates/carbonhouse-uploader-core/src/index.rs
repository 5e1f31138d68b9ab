//! Tree index rows for the metric paths of one file.
//!
//! Each metric `a.b.c` is decomposed into its dotted prefixes `a.` and
//! `a.b.` plus the leaf `a.b.c`, at levels 1, 2 and 3. A row is emitted only
//! for keys that are neither in the shared [`TreeCache`] nor already emitted
//! for the current file.

use crate::cache::TreeCache;
use crate::error::IndexError;
use std::collections::HashSet;
use std::io::BufRead;

const METRIC_COLUMN: usize = 0;
const DATE_COLUMN: usize = 3;

/// Rows built from one file, ready for the tree table.
#[derive(Debug, Default)]
pub struct TreeBatch {
    /// `date\tlevel\tkey\n` rows.
    pub payload: Vec<u8>,
    /// Every key emitted for this file. Committed to the cache once the
    /// payload has been accepted.
    pub keys: HashSet<String>,
    pub rows: usize,
    pub lines: u64,
}

impl TreeBatch {
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

/// First day of the month named by the leading `YYYYMMDD` of a date field.
pub fn effective_date(field: &str) -> Option<String> {
    let day = field.get(..8)?;
    if !day.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}01", &day[..6]))
}

fn metric_of(line: &str) -> Result<&str, String> {
    let metric = line.split('\t').nth(METRIC_COLUMN).unwrap_or_default();
    if metric.is_empty() {
        return Err("empty metric path".to_string());
    }
    Ok(metric)
}

fn date_of(line: &str) -> Result<String, String> {
    let date_field = line
        .split('\t')
        .nth(DATE_COLUMN)
        .ok_or_else(|| format!("expected at least {} columns", DATE_COLUMN + 1))?;
    effective_date(date_field)
        .ok_or_else(|| format!("date field {:?} does not start with YYYYMMDD", date_field))
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

fn push_row(payload: &mut Vec<u8>, date: &str, level: usize, key: &str) {
    payload.extend_from_slice(format!("{date}\t{level}\t{key}\n").as_bytes());
}

/// Reads every line of `reader` and builds the tree rows not yet known to
/// `cache`.
///
/// A malformed line aborts the whole file; nothing built so far is returned.
/// Lines whose metric is already known are skipped without further checks.
pub fn build_tree<R: BufRead>(mut reader: R, cache: &TreeCache) -> Result<TreeBatch, IndexError> {
    let mut batch = TreeBatch::default();
    let mut buf = Vec::<u8>::new();
    let known = |local: &HashSet<String>, key: &str| local.contains(key) || cache.contains(key);

    loop {
        buf.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| IndexError::Read {
                line_no: batch.lines + 1,
                source,
            })?;
        if bytes_read == 0 {
            break;
        }
        batch.lines += 1;
        let line_no = batch.lines;

        let raw = trim_line_ending(&buf);
        if raw.is_empty() {
            continue;
        }

        let line = std::str::from_utf8(raw)
            .map_err(|exc| IndexError::malformed(line_no, format!("invalid utf-8: {exc}")))?;
        let metric = metric_of(line).map_err(|reason| IndexError::malformed(line_no, reason))?;

        // Known metrics are skipped before the rest of the row is looked at.
        if known(&batch.keys, metric) {
            continue;
        }

        let date = date_of(line).map_err(|reason| IndexError::malformed(line_no, reason))?;

        let mut level = 1;
        let mut offset = 0;
        while let Some(pos) = metric[offset..].find('.') {
            let key = &metric[..offset + pos + 1];
            if !known(&batch.keys, key) {
                batch.keys.insert(key.to_string());
                push_row(&mut batch.payload, &date, level, key);
                batch.rows += 1;
            }
            offset += pos + 1;
            level += 1;
        }

        batch.keys.insert(metric.to_string());
        push_row(&mut batch.payload, &date, level, metric);
        batch.rows += 1;
    }

    Ok(batch)
}
