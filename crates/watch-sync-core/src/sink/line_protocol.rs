//! InfluxDB line protocol encoding.

use chrono::{DateTime, Utc};
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Integer(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

/// One point, timestamped at second precision.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: i64,
}

impl Point {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: timestamp.timestamp(),
        }
    }

    /// Empty tag values are not representable and are dropped.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn field_opt<T: Into<FieldValue>>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape(key, TAG_SPECIALS), escape(value, TAG_SPECIALS));
        }
        for (index, (key, value)) in self.fields.iter().enumerate() {
            line.push(if index == 0 { ' ' } else { ',' });
            line.push_str(&escape(key, TAG_SPECIALS));
            line.push('=');
            line.push_str(&encode_field(value));
        }
        let _ = write!(line, " {}", self.timestamp);
        line
    }
}

const TAG_SPECIALS: &[char] = &[',', '=', ' '];

fn escape(value: &str, specials: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => escaped.push_str("\\n"),
            c if specials.contains(&c) => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

fn encode_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::Float(v) if v.is_finite() => {
            let text = v.to_string();
            if text.contains('.') || text.contains('e') {
                text
            } else {
                format!("{}.0", text)
            }
        }
        FieldValue::Float(_) => "0.0".to_string(),
        FieldValue::Boolean(v) => v.to_string(),
        FieldValue::Text(v) => {
            let mut quoted = String::with_capacity(v.len() + 2);
            quoted.push('"');
            for c in v.chars() {
                match c {
                    '"' | '\\' => {
                        quoted.push('\\');
                        quoted.push(c);
                    }
                    '\n' => quoted.push_str("\\n"),
                    c => quoted.push(c),
                }
            }
            quoted.push('"');
            quoted
        }
    }
}

/// Join points into a request body, one per line.
pub fn encode_batch(points: &[Point]) -> String {
    points.iter().map(Point::to_line).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_basic_line() {
        let line = Point::new("watch_event", ts())
            .tag("media_type", "movie")
            .field("history_id", 1001u64)
            .field("runtime_min", 116.0)
            .field("title", "Arrival")
            .to_line();
        assert_eq!(
            line,
            "watch_event,media_type=movie history_id=1001i,runtime_min=116.0,title=\"Arrival\" 1771704000"
        );
    }

    #[test]
    fn test_escapes_tags_and_keys() {
        let line = Point::new("my measurement", ts())
            .tag("show title", "a,b=c d")
            .field("x", true)
            .to_line();
        assert_eq!(line, "my\\ measurement,show\\ title=a\\,b\\=c\\ d x=true 1771704000");
    }

    #[test]
    fn test_escapes_string_fields() {
        let line = Point::new("m", ts())
            .field("title", "The \"Best\" \\ Show")
            .to_line();
        assert_eq!(line, "m title=\"The \\\"Best\\\" \\\\ Show\" 1771704000");
    }

    #[test]
    fn test_optional_fields_and_empty_tags() {
        let line = Point::new("m", ts())
            .tag("empty", "")
            .field("a", 1.25)
            .field_opt("year", None::<u32>)
            .field_opt("season", Some(2u32))
            .to_line();
        assert_eq!(line, "m a=1.25,season=2i 1771704000");
    }

    #[test]
    fn test_encode_batch() {
        let points = vec![
            Point::new("m", ts()).field("a", 1i64),
            Point::new("m", ts()).field("a", 2i64),
        ];
        assert_eq!(encode_batch(&points), "m a=1i 1771704000\nm a=2i 1771704000");
    }
}
