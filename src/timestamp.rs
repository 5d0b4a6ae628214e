//! Timestamp and trace-file name codec.
//!
//! Trace files are named `{pid}_{YYYY-MM-DD-HH-MM-SS}.{ext}`. The writer
//! (session step) and the retention sweeper both depend on this shape.

use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::LazyLock;

/// chrono format string for the embedded timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

static TRACE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})$").unwrap()
});

/// Format a local wall-clock time as `YYYY-MM-DD-HH-MM-SS`.
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
}

/// Build a trace file name: `{pid}_{timestamp}.{ext}`.
pub fn trace_file_name(pid: u32, ts: NaiveDateTime, ext: &str) -> String {
    format!("{pid}_{}.{ext}", format_timestamp(ts))
}

/// Components recovered from a trace file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceName {
    pub pid: u32,
    pub timestamp: NaiveDateTime,
}

/// Why a file name could not be read as a trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceNameError {
    /// Name does not end in `.{ext}`.
    Extension { expected: String },
    /// Name is not `{digits}_{timestamp}`.
    Shape,
    /// Timestamp segment has the right shape but is not a real date/time.
    Timestamp(String),
}

impl std::fmt::Display for TraceNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceNameError::Extension { expected } => {
                write!(f, "extension is not .{expected}")
            }
            TraceNameError::Shape => write!(f, "name is not {{pid}}_{{timestamp}}"),
            TraceNameError::Timestamp(msg) => write!(f, "invalid timestamp: {msg}"),
        }
    }
}

impl std::error::Error for TraceNameError {}

/// Parse `{pid}_{timestamp}.{ext}` back into its parts.
pub fn parse_trace_file_name(name: &str, ext: &str) -> Result<TraceName, TraceNameError> {
    let stem = name
        .strip_suffix(ext)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| TraceNameError::Extension {
            expected: ext.to_string(),
        })?;

    let caps = TRACE_NAME.captures(stem).ok_or(TraceNameError::Shape)?;
    let pid: u32 = caps[1].parse().map_err(|_| TraceNameError::Shape)?;
    let timestamp =
        parse_timestamp(&caps[2]).map_err(|e| TraceNameError::Timestamp(e.to_string()))?;

    Ok(TraceName { pid, timestamp })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(at(10, 0, 5)), "2024-01-01-10-00-05");
    }

    #[test]
    fn test_trace_file_name() {
        assert_eq!(
            trace_file_name(111, at(10, 16, 0), "json"),
            "111_2024-01-01-10-16-00.json"
        );
    }

    #[test]
    fn test_parse_then_format_reproduces_timestamp() {
        for name in [
            "111_2024-01-01-10-00-00.json",
            "9_1999-12-31-23-59-59.json",
            "4294967295_2024-02-29-00-00-01.json",
        ] {
            let parsed = parse_trace_file_name(name, "json").unwrap();
            let original = name.split('_').nth(1).unwrap().strip_suffix(".json").unwrap();
            assert_eq!(format_timestamp(parsed.timestamp), original);
        }
    }

    #[test]
    fn test_parse_recovers_pid() {
        let parsed = parse_trace_file_name("222_2024-01-01-10-20-00.json", "json").unwrap();
        assert_eq!(parsed.pid, 222);
        assert_eq!(parsed.timestamp, at(10, 20, 0));
    }

    #[test]
    fn test_parse_wrong_extension() {
        let err = parse_trace_file_name("111_2024-01-01-10-00-00.txt", "json").unwrap_err();
        assert!(matches!(err, TraceNameError::Extension { .. }));

        // Extension must be a whole dotted suffix
        let err = parse_trace_file_name("111_2024-01-01-10-00-00xjson", "json").unwrap_err();
        assert!(matches!(err, TraceNameError::Extension { .. }));
    }

    #[test]
    fn test_parse_no_underscore() {
        let err = parse_trace_file_name("notes.json", "json").unwrap_err();
        assert_eq!(err, TraceNameError::Shape);
    }

    #[test]
    fn test_parse_non_numeric_timestamp() {
        let err = parse_trace_file_name("111_yesterday.json", "json").unwrap_err();
        assert_eq!(err, TraceNameError::Shape);
    }

    #[test]
    fn test_parse_extra_segments() {
        let err = parse_trace_file_name("111_2024-01-01-10-00-00_x.json", "json").unwrap_err();
        assert_eq!(err, TraceNameError::Shape);
    }

    #[test]
    fn test_parse_out_of_range_timestamp() {
        let err = parse_trace_file_name("111_2024-13-01-10-00-00.json", "json").unwrap_err();
        assert!(matches!(err, TraceNameError::Timestamp(_)));
        assert!(err.to_string().starts_with("invalid timestamp"));
    }
}
