//! Classification of external tool output lines.
//!
//! rsync's `--info=progress2` output is meant for humans, so recognising it is a
//! heuristic. Everything that depends on its exact format lives behind the
//! [`LineParser`] trait so the pipeline only ever sees [`ProgressEvent`]s.

use regex::Regex;
use std::sync::LazyLock;

/// Marker tokens rsync appends to overall-progress lines ("items remaining").
const REMAINING_MARKERS: [&str; 2] = ["to-chk=", "ir-chk="];

// "1,234,567" or "1,234,567  89%"
static BARE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d,]+(\s+\d+%)?$").expect("valid regex"));

// "... 0:00:05" style trailers followed by a trailing "s"
static DURATION_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d:]+s$").expect("valid regex"));

// "1.23G", "1.23GB", "512"
static SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)([kmgtp]?)b?$").expect("valid regex"));

// "10.25MB/s", "512.00kB/s", "3.1GiB/s"
static RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)?)([kmgtp]?)(i?b)/s$").expect("valid regex")
});

/// A structured reading of one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Overall progress. Either field may be absent depending on the line.
    Progress {
        bytes_done: Option<i64>,
        speed_bps: Option<u64>,
    },
    /// A file name the tool is working on.
    CurrentFile(String),
    /// Progress-bar fragments and other output with nothing to report.
    Noise,
}

/// Narrow seam between raw tool output and the pipeline.
pub trait LineParser: Send + Sync {
    /// Returns `None` for blank lines.
    fn parse(&self, line: &str) -> Option<ProgressEvent>;
}

/// Parser for rsync's human-oriented progress output.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsyncLineParser;

impl LineParser for RsyncLineParser {
    fn parse(&self, line: &str) -> Option<ProgressEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let speed_bps = tokens.iter().find_map(|t| parse_rate(t));

        if tokens.len() >= 2 {
            if let Ok(bytes) = tokens[0].replace(',', "").parse::<i64>() {
                return Some(ProgressEvent::Progress {
                    bytes_done: Some(bytes),
                    speed_bps,
                });
            }
            // --human-readable prints scaled sizes ahead of the percentage
            if tokens[1].ends_with('%') {
                if let Some(bytes) = parse_size(tokens[0]) {
                    return Some(ProgressEvent::Progress {
                        bytes_done: Some(bytes),
                        speed_bps,
                    });
                }
            }
        }

        if is_noise(trimmed) {
            return Some(match speed_bps {
                Some(speed) => ProgressEvent::Progress {
                    bytes_done: None,
                    speed_bps: Some(speed),
                },
                None => ProgressEvent::Noise,
            });
        }

        Some(ProgressEvent::CurrentFile(trimmed.to_string()))
    }
}

/// True for lines that look like progress-bar output rather than a file name.
pub fn is_noise(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line == "." || line == "./" {
        return true;
    }
    if line.contains('%') && line.contains('/') {
        return true;
    }
    if REMAINING_MARKERS.iter().any(|m| line.contains(m)) {
        return true;
    }
    BARE_COUNT.is_match(line) || DURATION_TAIL.is_match(line)
}

/// Parse a decimal-scaled size such as `1.23G` into bytes.
pub fn parse_size(token: &str) -> Option<i64> {
    let caps = SIZE.captures(token)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let exp = unit_exponent(caps.get(2)?.as_str())?;
    Some((value * 1000f64.powi(exp)).round() as i64)
}

fn unit_exponent(prefix: &str) -> Option<i32> {
    match prefix.to_ascii_lowercase().as_str() {
        "" => Some(0),
        "k" => Some(1),
        "m" => Some(2),
        "g" => Some(3),
        "t" => Some(4),
        "p" => Some(5),
        _ => None,
    }
}

/// Parse a transfer-rate token into bytes per second.
pub fn parse_rate(token: &str) -> Option<u64> {
    let caps = RATE.captures(token)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let binary = caps.get(3)?.as_str().eq_ignore_ascii_case("ib");
    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let exp = unit_exponent(caps.get(2)?.as_str())?;
    Some((value * base.powi(exp)).round() as u64)
}
