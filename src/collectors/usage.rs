//! Per-process bandwidth from `nettop` CSV output, plus the short-lived cache
//! that keeps the expensive probe from running on every poll.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::parse::{collect_records, ParsedLine};

pub const NETTOP_PROGRAM: &str = "nettop";
pub const NETTOP_ARGS: &[&str] = &["-P", "-L", "1", "-x", "-t", "wifi", "-t", "wired"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUsageSample {
    pub pid: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub process_name: String,
}

/// Column positions taken from the CSV header row
#[derive(Debug, Clone, Default)]
pub struct NettopColumns {
    index: HashMap<String, usize>,
}

impl NettopColumns {
    /// Recognize a header row by its `bytes_in` column
    pub fn from_header(fields: &[&str]) -> Option<Self> {
        if !fields.iter().any(|f| *f == "bytes_in") {
            return None;
        }
        let index = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_empty())
            .map(|(i, f)| ((*f).to_string(), i))
            .collect();
        Some(Self { index })
    }

    fn value(&self, fields: &[&str], column: &str) -> u64 {
        self.index
            .get(column)
            .and_then(|&i| fields.get(i))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// `name.pid` identity column; timestamps (which contain `:`) are not identities.
fn split_identity(field: &str) -> Option<(&str, u32)> {
    if field.contains(':') {
        return None;
    }
    let (name, pid) = field.rsplit_once('.')?;
    if name.is_empty() {
        return None;
    }
    pid.parse().ok().map(|pid| (name, pid))
}

pub fn parse_nettop_row(columns: &NettopColumns, line: &str) -> ParsedLine<NetworkUsageSample> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.iter().all(|f| f.is_empty()) {
        return ParsedLine::Skip;
    }
    let Some((name, pid)) = fields.iter().find_map(|f| split_identity(f)) else {
        return ParsedLine::Malformed(format!("no process identity in {line:?}"));
    };
    ParsedLine::Record(NetworkUsageSample {
        pid,
        bytes_in: columns.value(&fields, "bytes_in"),
        bytes_out: columns.value(&fields, "bytes_out"),
        packets_in: columns.value(&fields, "packets_in"),
        packets_out: columns.value(&fields, "packets_out"),
        process_name: name.to_string(),
    })
}

/// Parse logging-mode output; rows before the first header are ignored.
pub fn parse_nettop(output: &str) -> Vec<NetworkUsageSample> {
    let mut columns: Option<NettopColumns> = None;
    let rows = output.lines().map(|line| {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if let Some(header) = NettopColumns::from_header(&fields) {
            columns = Some(header);
            return ParsedLine::Skip;
        }
        match &columns {
            Some(c) => parse_nettop_row(c, line),
            None => ParsedLine::Skip,
        }
    });
    collect_records("nettop", rows)
}

struct UsageSnapshot {
    taken_at: Instant,
    samples: Vec<NetworkUsageSample>,
}

/// Single shared snapshot guarded by a TTL check; last writer wins.
#[derive(Default)]
pub struct UsageCache {
    slot: Mutex<Option<UsageSnapshot>>,
}

impl UsageCache {
    /// Cached samples when younger than `ttl`
    pub fn fresh(&self, ttl: Duration) -> Option<Vec<NetworkUsageSample>> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|s| s.taken_at.elapsed() < ttl)
            .map(|s| s.samples.clone())
    }

    /// Whatever was cached last, regardless of age
    pub fn last(&self) -> Vec<NetworkUsageSample> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|s| s.samples.clone()).unwrap_or_default()
    }

    pub fn store(&self, samples: Vec<NetworkUsageSample>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(UsageSnapshot {
            taken_at: Instant::now(),
            samples,
        });
    }
}
