use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

/// Source position: a Slack `ts` or an epoch-seconds capture time. Zero means
/// "from the beginning".
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct Cursor(pub f64);

impl Cursor {
    pub const ZERO: Cursor = Cursor(0.0);

    /// Parse a Slack-style `"1726752000.123456"` timestamp.
    pub fn parse(s: &str) -> Option<Cursor> {
        let v: f64 = s.trim().parse().ok()?;
        (v.is_finite() && v >= 0.0).then_some(Cursor(v))
    }

    pub fn from_datetime(dt: &DateTime<FixedOffset>) -> Cursor {
        Cursor(dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1e6)
    }

    pub fn is_zero(&self) -> bool {
        self.0 <= 0.0
    }

    /// Six-digit rendering used for Slack's `oldest` parameter; `None` for zero.
    pub fn as_oldest_param(&self) -> Option<String> {
        (!self.is_zero()).then(|| format!("{:.6}", self.0))
    }

    pub fn total_cmp(&self, other: &Cursor) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }

    pub fn max(self, other: Cursor) -> Cursor {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Untyped fields exactly as a source returned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    pub fn from_value(value: Value) -> Option<RawRecord> {
        match value {
            Value::Object(map) => Some(RawRecord(map)),
            _ => None,
        }
    }

    /// Trimmed, non-empty string field. Numbers are rendered as text.
    pub fn text(&self, key: &str) -> Option<String> {
        let s = match self.0.get(key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!s.is_empty()).then_some(s)
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    InStock,
    OutOfStock,
    Unknown,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "in_stock",
            Availability::OutOfStock => "out_of_stock",
            Availability::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub keyword: Option<String>,
    pub title: Option<String>,
    pub price: Option<u64>,
    pub currency: String,
    pub availability: Availability,
    pub url: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    pub user: String,
    pub text: Option<String>,
    pub permalink: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Product(Product),
    Message(Message),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    /// Natural key: ASIN or message ts.
    pub key: String,
    pub rank: usize,
    pub position: Cursor,
    pub captured_at: DateTime<FixedOffset>,
    pub source: String,
    pub payload: Payload,
}

impl CanonicalRecord {
    pub fn price(&self) -> Option<u64> {
        match &self.payload {
            Payload::Product(p) => p.price,
            Payload::Message(_) => None,
        }
    }
}
