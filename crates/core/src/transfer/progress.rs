//! Best-effort parsing of the transfer tool's statistics lines.
//!
//! The tool prints a cumulative figure per process, e.g.
//! `Transferred:   1.234 GiB / 10.000 GiB, 12%, 45.6 MiB/s, ETA 3m`.
//! Only the cumulative figure matters; everything else is optional.

use regex_lite::Regex;

use super::error::TransferError;
use crate::quota::parse_size;

/// Requires a unit so the file-count line (`Transferred: 3 / 10, 30%`) is skipped.
pub const DEFAULT_PROGRESS_PATTERN: &str = r"Transferred:\s+([0-9.]+\s*[A-Za-z]+)\s*/";

/// One recognised statistics line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes beyond the highest figure seen so far in this process.
    pub delta_bytes: u64,
    pub total_bytes: u64,
    /// Rate field, verbatim (`45.6 MiB/s`).
    pub speed: Option<String>,
}

/// Turns cumulative figures into deltas for a single process.
pub struct ProgressParser {
    pattern: Regex,
    last_total: u64,
}

impl ProgressParser {
    pub fn new(pattern: Option<&str>) -> Result<Self, TransferError> {
        let source = pattern.unwrap_or(DEFAULT_PROGRESS_PATTERN);
        let pattern = Regex::new(source).map_err(|e| TransferError::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern,
            last_total: 0,
        })
    }

    /// `None` for lines that carry no usable figure.
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressSample> {
        let captures = self.pattern.captures(line)?;
        let total = parse_size(captures.get(1)?.as_str()).ok()?;

        // Figures are rounded by the tool and can wobble downwards.
        let delta = total.saturating_sub(self.last_total);
        self.last_total = self.last_total.max(total);

        Some(ProgressSample {
            delta_bytes: delta,
            total_bytes: self.last_total,
            speed: extract_speed(line),
        })
    }

    pub fn total(&self) -> u64 {
        self.last_total
    }
}

fn extract_speed(line: &str) -> Option<String> {
    line.split(',')
        .map(str::trim)
        .find(|part| part.ends_with("/s"))
        .map(String::from)
}
