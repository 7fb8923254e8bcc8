use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

/// One parsed line of streamed executor output, before it is attached to a
/// persisted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub line_no: i64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Split a streamed chunk into line-numbered entries.
///
/// `start_line` is the next free line number for the execution; callers keep
/// the counter so numbering stays monotonic across chunks.
pub fn chunk_to_entries(chunk: &str, source: LogSource, start_line: i64) -> Vec<ExecutionLogEntry> {
    let level = match source {
        LogSource::Stderr => LogLevel::Error,
        _ => LogLevel::Info,
    };
    chunk
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| ExecutionLogEntry {
            line_no: start_line + i as i64,
            level,
            source,
            message: line.to_string(),
            timestamp: Utc::now(),
        })
        .collect()
}
