//! Parsers for the exporter's free-text output.
//!
//! The exporter prints human-oriented text, so these functions scrape it.
//! They never fail: input that does not match yields an empty list, zero, or
//! `None`.
//!
//! Known weakness of the noise filter: a mailbox whose bare name contains
//! `=` or the word `messages` is dropped from `list` output.

use std::sync::LazyLock;

use regex::Regex;

/// Marker the exporter prints in front of failures.
pub const FAILURE_MARKER: char = '\u{2717}';

/// Returned by [`parse_error_line`] when no line looks like an error.
pub const UNKNOWN_ERROR: &str = "Unknown error";

const NOISE: &[&str] = &["=", "Mailboxes", "Connecting", "messages"];

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s+(.+)$").expect("valid regex"));
static MESSAGE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s*([\d,]+)\s+messages").expect("valid regex"));
static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)/(\d+)\]\s+([\d.]+)%").expect("valid regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[^\s]+").expect("valid regex"));

/// Mailbox names from `list` output, in order, duplicates kept.
pub fn parse_mailbox_list(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(caps) = NUMBERED_LINE.captures(trimmed) {
            let name = caps[1].trim();
            if !name.is_empty() {
                names.push(name.to_string());
            }
        } else if !trimmed.is_empty() && !NOISE.iter().any(|noise| trimmed.contains(noise)) {
            names.push(trimmed.to_string());
        }
    }
    names
}

/// Message count from `count` output such as `Archive: 1,234 messages`.
pub fn parse_message_count(text: &str) -> u64 {
    MESSAGE_COUNT
        .captures(text)
        .map(|caps| {
            caps[1]
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

/// Progress fraction from an export chunk containing `[done/total] pct%`.
pub fn parse_progress(chunk: &str) -> Option<f64> {
    let caps = PROGRESS.captures(chunk)?;
    let percent: f64 = caps[3].parse().ok()?;
    Some(percent / 100.0)
}

/// The first line that reads like a failure, without the failure marker.
pub fn parse_error_line(text: &str) -> String {
    text.lines()
        .find(|line| {
            line.contains(FAILURE_MARKER) || line.contains("error") || line.contains("failed")
        })
        .map(|line| line.replace(FAILURE_MARKER, "").trim().to_string())
        .unwrap_or_else(|| UNKNOWN_ERROR.to_string())
}

/// Microsoft sign-in URL printed by `setup`, if this text contains one.
pub fn extract_login_url(text: &str) -> Option<String> {
    URL.find_iter(text)
        .map(|m| m.as_str())
        .find(|url| url.contains("microsoft.com") || url.contains("microsoftonline.com"))
        .map(str::to_string)
}
