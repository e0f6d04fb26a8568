//! NR-040: Append-only JSONL provenance event log.

use crate::core::instrument::EventSink;
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Generate an ISO 8601 UTC timestamp.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_iso8601(secs)
}

/// Seconds since the Unix epoch to `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_iso8601(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs % 86400 / 3600, secs % 3600 / 60, secs % 60);
    let (y, m, d) = civil_from_days((secs / 86400) as i64);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a machine.
pub fn event_log_path(state_dir: &Path, machine: &str) -> PathBuf {
    state_dir.join(machine).join("events.jsonl")
}

/// Append an event to the machine's event log.
pub fn append_event(state_dir: &Path, machine: &str, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, machine);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read the last `limit` events of a machine's log. Missing log is empty.
pub fn read_events(
    state_dir: &Path,
    machine: &str,
    limit: usize,
) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, machine);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: TimestampedEvent = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {}", path.display(), n + 1, e))?;
        events.push(event);
    }
    let skip = events.len().saturating_sub(limit);
    Ok(events.split_off(skip))
}

/// Sink that appends every event to the machine's JSONL log.
///
/// Write failures are logged and swallowed; provenance never fails a run.
pub struct JsonlSink {
    state_dir: PathBuf,
    machine: String,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(state_dir: &Path, machine: &str) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            machine: machine.to_string(),
            lock: Mutex::new(()),
        }
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: ProvenanceEvent) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = append_event(&self.state_dir, &self.machine, event) {
            warn!(machine = %self.machine, error = %e, "event log write failed");
        }
    }
}
