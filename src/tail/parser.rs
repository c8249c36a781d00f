use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

use super::lines::Line;

/// A decoded log entry: the JSON object plus its timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawEntry {
    pub timestamp: String,
    pub fields: Map<String, Value>,
}

impl RawEntry {
    /// Build an entry from a decoded JSON value, taking the timestamp from `timestamp_field`
    pub fn from_value(value: Value, timestamp_field: &str) -> Result<Self, DecodeError> {
        let fields = match value {
            Value::Object(fields) => fields,
            _ => return Err(DecodeError::NotAnObject),
        };

        let timestamp = match fields.get(timestamp_field) {
            Some(Value::String(ts)) => ts.clone(),
            Some(_) => return Err(DecodeError::NonStringTimestamp(timestamp_field.to_string())),
            None => return Err(DecodeError::MissingTimestamp(timestamp_field.to_string())),
        };

        Ok(Self { timestamp, fields })
    }

    /// Compact JSON rendering with top-level keys in sorted order
    pub fn to_json(&self) -> String {
        let sorted: BTreeMap<&String, &Value> = self.fields.iter().collect();
        serde_json::to_string(&sorted).unwrap_or_default()
    }

    /// Hex SHA-256 of [`RawEntry::to_json`]
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.to_json().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing timestamp field '{0}'")]
    MissingTimestamp(String),

    #[error("timestamp field '{0}' is not a string")]
    NonStringTimestamp(String),
}

/// Classification of one line
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Accepted(RawEntry),
    Blank,
    /// Decoded, but not newer than the source watermark
    BelowWatermark,
    /// Undecodable first line of a read that resumed at a non-zero offset
    ResumedMidLine,
    /// Undecodable unterminated tail; the writer is likely mid-line
    WriterInProgress,
    /// Undecodable line anywhere else
    Malformed(String),
}

impl LineOutcome {
    /// Whether the line's bytes advance the stored offset.
    ///
    /// A writer-in-progress tail is left in place so the next cycle reads it
    /// again once it is complete.
    pub fn consumes_bytes(&self) -> bool {
        !matches!(self, LineOutcome::WriterInProgress)
    }
}

/// Decodes lines of one read into entries and classifies failures by position
#[derive(Debug, Clone)]
pub struct EntryParser {
    timestamp_field: String,
    watermark: Option<String>,
    resumed: bool,
}

impl EntryParser {
    /// `resumed` is true when the read started at a non-zero offset
    pub fn new(timestamp_field: &str, watermark: Option<String>, resumed: bool) -> Self {
        Self {
            timestamp_field: timestamp_field.to_string(),
            watermark,
            resumed,
        }
    }

    pub fn parse(&self, line: &Line) -> LineOutcome {
        if line.oversized {
            return self.reject_oversized(line);
        }
        if !line.is_last_overall && line.is_blank() {
            return LineOutcome::Blank;
        }

        match self.decode(line) {
            Ok(entry) => match &self.watermark {
                Some(watermark) if entry.timestamp.as_str() <= watermark.as_str() => {
                    LineOutcome::BelowWatermark
                }
                _ => LineOutcome::Accepted(entry),
            },
            // An unterminated tail may still be completed, so it wins over the
            // resumed-mid-line rule when a line is both first and last
            Err(_) if line.is_last_overall => LineOutcome::WriterInProgress,
            Err(_) if line.is_first_overall && self.resumed => LineOutcome::ResumedMidLine,
            Err(e) => LineOutcome::Malformed(e.to_string()),
        }
    }

    /// Position rules as for an undecodable line, without decoding it
    fn reject_oversized(&self, line: &Line) -> LineOutcome {
        if line.is_last_overall {
            LineOutcome::WriterInProgress
        } else if line.is_first_overall && self.resumed {
            LineOutcome::ResumedMidLine
        } else {
            LineOutcome::Malformed(format!(
                "line of {} bytes exceeds the line size limit",
                line.len
            ))
        }
    }

    pub fn decode(&self, line: &Line) -> Result<RawEntry, DecodeError> {
        let value = serde_json::from_str::<Value>(line.text()?)?;
        RawEntry::from_value(value, &self.timestamp_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, first: bool, last: bool) -> Line {
        Line {
            bytes: text.as_bytes().to_vec(),
            len: text.len() as u64 + if last { 0 } else { 1 },
            number: 1,
            is_first_overall: first,
            is_last_overall: last,
            oversized: false,
        }
    }

    #[test]
    fn test_accepts_entry_above_watermark() {
        let parser = EntryParser::new("T", Some("2025-12-03T20:00:00".to_string()), true);
        match parser.parse(&line(r#"{"T":"2025-12-03T20:51:20.119","QH":"example.com"}"#, false, false)) {
            LineOutcome::Accepted(entry) => {
                assert_eq!(entry.timestamp, "2025-12-03T20:51:20.119");
                assert_eq!(entry.fields["QH"], "example.com");
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn test_drops_entry_at_or_below_watermark() {
        let parser = EntryParser::new("T", Some("2025-12-03T20:00:00".to_string()), false);
        let outcome = parser.parse(&line(r#"{"T":"2025-12-03T20:00:00"}"#, false, false));
        assert_eq!(outcome, LineOutcome::BelowWatermark);
        assert!(outcome.consumes_bytes());
    }

    #[test]
    fn test_first_line_of_resumed_read_is_expected_partial() {
        let parser = EntryParser::new("T", None, true);
        let outcome = parser.parse(&line(r#"20:51:20","QH":"x"}"#, true, false));
        assert_eq!(outcome, LineOutcome::ResumedMidLine);
        assert!(outcome.consumes_bytes());
    }

    #[test]
    fn test_first_line_of_full_read_is_malformed() {
        let parser = EntryParser::new("T", None, false);
        let outcome = parser.parse(&line(r#"20:51:20","QH":"x"}"#, true, false));
        assert!(matches!(outcome, LineOutcome::Malformed(_)));
    }

    #[test]
    fn test_unterminated_tail_is_not_consumed() {
        let parser = EntryParser::new("T", None, false);
        let outcome = parser.parse(&line(r#"{"T":"2025-12-03T2"#, false, true));
        assert_eq!(outcome, LineOutcome::WriterInProgress);
        assert!(!outcome.consumes_bytes());
    }

    #[test]
    fn test_first_and_last_prefers_writer_in_progress() {
        let parser = EntryParser::new("T", None, true);
        let outcome = parser.parse(&line(r#"{"T":"20"#, true, true));
        assert_eq!(outcome, LineOutcome::WriterInProgress);
    }

    #[test]
    fn test_complete_unterminated_entry_is_accepted() {
        let parser = EntryParser::new("T", None, false);
        assert!(matches!(
            parser.parse(&line(r#"{"T":"2025"}"#, false, true)),
            LineOutcome::Accepted(_)
        ));
    }

    #[test]
    fn test_missing_or_non_string_timestamp_is_malformed() {
        let parser = EntryParser::new("T", None, false);
        match parser.parse(&line(r#"{"QH":"example.com"}"#, false, false)) {
            LineOutcome::Malformed(reason) => assert!(reason.contains("missing timestamp")),
            other => panic!("expected Malformed, got {:?}", other),
        }
        assert!(matches!(
            parser.parse(&line(r#"{"T":12}"#, false, false)),
            LineOutcome::Malformed(_)
        ));
        assert!(matches!(
            parser.parse(&line(r#"[1,2]"#, false, false)),
            LineOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_oversized_line_is_malformed_and_consumed() {
        let parser = EntryParser::new("T", None, false);
        let mut long = line(r#"{"T":"2025-12-03","#, false, false);
        long.oversized = true;
        long.len = 5_000_000;

        let outcome = parser.parse(&long);
        match &outcome {
            LineOutcome::Malformed(reason) => assert!(reason.contains("5000000 bytes")),
            other => panic!("expected Malformed, got {:?}", other),
        }
        assert!(outcome.consumes_bytes());
    }

    #[test]
    fn test_oversized_position_rules() {
        let mut tail = line(r#"{"T":"2025"}"#, false, true);
        tail.oversized = true;
        assert_eq!(
            EntryParser::new("T", None, false).parse(&tail),
            LineOutcome::WriterInProgress
        );

        let mut head = line(r#"{"T":"2025"}"#, true, false);
        head.oversized = true;
        assert_eq!(
            EntryParser::new("T", None, true).parse(&head),
            LineOutcome::ResumedMidLine
        );
    }

    #[test]
    fn test_blank_line() {
        let parser = EntryParser::new("T", None, false);
        assert_eq!(parser.parse(&line("   ", false, false)), LineOutcome::Blank);
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let parser = EntryParser::new("T", None, false);
        let a = parser.decode(&line(r#"{"T":"1","a":1,"b":2}"#, false, false)).unwrap();
        let b = parser.decode(&line(r#"{"b":2,"a":1,"T":"1"}"#, false, false)).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
