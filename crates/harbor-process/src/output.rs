//! Output parsing
//!
//! Port discovery is coupled to the exact log line format of the launched
//! binary, so it lives behind the narrow [`PortAnnouncement`] interface.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;

use crate::error::Result;

/// Pattern matched against every output line; capture group 1 is the port.
pub const DEFAULT_PORT_PATTERN: &str = r"(?i)server listening on https?://[^\s]+:(\d+)";

const STDERR_CAPACITY: usize = 50;

static DEFAULT_PORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(DEFAULT_PORT_PATTERN).expect("DEFAULT_PORT_PATTERN is a compile-time constant")
});

/// Extracts an announced listening port from one line of output.
pub trait PortAnnouncement: Send + Sync {
    /// Return the port if `line` announces one.
    fn parse_port(&self, line: &str) -> Option<u16>;
}

/// Regex-backed parser.
///
/// Also accepts a JSON log line carrying a numeric `port` field, provided the
/// line mentions "listening".
#[derive(Debug, Clone)]
pub struct RegexPortParser {
    pattern: Regex,
}

impl RegexPortParser {
    /// Compile a parser; capture group 1 must match the port digits.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl Default for RegexPortParser {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PORT_REGEX.clone(),
        }
    }
}

impl PortAnnouncement for RegexPortParser {
    fn parse_port(&self, line: &str) -> Option<u16> {
        if let Some(port) = self
            .pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        {
            return Some(port);
        }

        if !line.to_lowercase().contains("listening") {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
        value
            .get("port")
            .and_then(|p| p.as_u64())
            .and_then(|p| u16::try_from(p).ok())
    }
}

#[derive(Debug, Default)]
struct TailState {
    last_line: Option<String>,
    stderr: VecDeque<String>,
}

/// Shared view of the most recent output of one process.
///
/// Cheap to clone; every clone sees the same lines.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    state: Arc<Mutex<TailState>>,
}

impl OutputTail {
    pub(crate) fn record(&self, line: &str, is_stderr: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_line = Some(line.to_string());
        if is_stderr {
            if state.stderr.len() == STDERR_CAPACITY {
                state.stderr.pop_front();
            }
            state.stderr.push_back(line.to_string());
        }
    }

    /// Most recent non-empty line from either stream.
    pub fn last_line(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_line
            .clone()
    }

    /// Captured stderr lines, newline-joined. Empty if nothing was written.
    pub fn stderr_text(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stderr.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
