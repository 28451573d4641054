//! Monitor output classification
//!
//! The monitor child speaks a loose text protocol: marker substrings on its
//! stdout/stderr. Raw chunks are split into lines by [`LineBuffer`] and each
//! complete line is mapped to exactly one [`Classification`] by
//! [`Classifier::classify`]; nothing downstream looks at the text again.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MarkerConfig;
use crate::state_machine::StreamKind;

/// Longest run without a newline before it is flushed as a line.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// `2024-05-01 10:00:00 - INFO - message`, the monitor's logging format.
static LOG_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:,\d+)? - (DEBUG|INFO|WARNING|ERROR|CRITICAL) - ")
        .expect("static regex")
});

static MONITOR_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z][\w ]*?)\s*:\s*(Running|Stopped)\s*$").expect("static regex")
});

const MONITOR_REPORT: &str = "Monitor Status |";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ready,
    Integrated,
    AdminRequired,
    Fatal,
    /// Per-component status report: `(name, running)`.
    MonitorReport(Vec<(String, bool)>),
    /// Unclassified stderr.
    Warning,
    Info,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    markers: MarkerConfig,
}

impl Classifier {
    pub fn new(markers: MarkerConfig) -> Self {
        Self { markers }
    }

    pub fn classify(&self, stream: StreamKind, line: &str) -> Classification {
        let has = |needles: &Vec<String>| contains_any(line, needles);

        if has(&self.markers.admin_required) {
            return Classification::AdminRequired;
        }
        if has(&self.markers.fatal) {
            return Classification::Fatal;
        }
        if stream == StreamKind::Stdout {
            if has(&self.markers.ready) {
                return Classification::Ready;
            }
            if has(&self.markers.integrated) {
                return Classification::Integrated;
            }
        }
        if let Some(report) = parse_monitor_report(line) {
            return Classification::MonitorReport(report);
        }

        match stream {
            StreamKind::Stdout => Classification::Info,
            StreamKind::Stderr => match log_level(line) {
                Some("DEBUG" | "INFO") => Classification::Info,
                _ if line.trim().is_empty() => Classification::Info,
                _ => Classification::Warning,
            },
        }
    }
}

fn contains_any(line: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|m| !m.is_empty() && line.contains(m.as_str()))
}

fn log_level(line: &str) -> Option<&str> {
    LOG_LEVEL
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// `... Monitor Status | Login: Running | Process: Stopped`
fn parse_monitor_report(line: &str) -> Option<Vec<(String, bool)>> {
    let idx = line.find(MONITOR_REPORT)?;
    let entries: Vec<(String, bool)> = line[idx + MONITOR_REPORT.len()..]
        .split('|')
        .filter_map(|part| {
            let caps = MONITOR_ENTRY.captures(part)?;
            Some((caps[1].to_string(), &caps[2] == "Running"))
        })
        .collect();
    (!entries.is_empty()).then_some(entries)
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = memchr::memchr(b'\n', rest) {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);

        while self.pending.len() >= MAX_PENDING_LINE {
            let tail = self.pending.split_off(MAX_PENDING_LINE);
            lines.push(self.take_line());
            self.pending = tail;
        }
        lines
    }

    /// Flush a trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| self.take_line())
    }

    fn take_line(&mut self) -> String {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}
