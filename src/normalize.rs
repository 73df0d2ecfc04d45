use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use tracing::debug;

use crate::error::RecordSkipped;
use crate::fetch::amazon::dp_url;
use crate::record::{Availability, CanonicalRecord, Cursor, Message, Payload, Product, RawRecord};

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9][0-9,，]*").unwrap());

pub trait Normalizer {
    /// The only failure is a missing natural key; every other field degrades
    /// to absent.
    fn normalize(&self, raw: &RawRecord, rank: usize) -> Result<CanonicalRecord, RecordSkipped>;
}

/// First run of digits (thousands separators allowed) as an integer:
/// `"¥3,520"` → 3520, `"￥1,980 - ￥2,480"` → 1980.
pub fn extract_price(text: &str) -> Option<u64> {
    let digits: String = PRICE_RE
        .find(text)?
        .as_str()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

pub fn map_availability(text: &str) -> Availability {
    let t = text.to_lowercase();
    if t.contains("在庫あり") || t.contains("通常配送") {
        Availability::InStock
    } else if t.contains("在庫切れ") {
        Availability::OutOfStock
    } else {
        Availability::Unknown
    }
}

pub struct ProductNormalizer {
    pub keyword: Option<String>,
    pub source: String,
    pub captured_at: DateTime<FixedOffset>,
}

impl Normalizer for ProductNormalizer {
    fn normalize(&self, raw: &RawRecord, rank: usize) -> Result<CanonicalRecord, RecordSkipped> {
        let asin = raw
            .text("asin")
            .ok_or_else(|| RecordSkipped::new("normalize", None, "record without asin"))?;

        let price = raw
            .text("price_text")
            .or_else(|| raw.text("price"))
            .and_then(|p| extract_price(&p));
        let availability = raw
            .text("availability_text")
            .map(|t| map_availability(&t))
            .unwrap_or(Availability::Unknown);
        let url = raw.text("url").or_else(|| Some(dp_url(&asin)));
        if raw.flag("detail_filled") {
            debug!("{}: fields filled from detail page", asin);
        }

        Ok(CanonicalRecord {
            rank,
            position: Cursor::from_datetime(&self.captured_at),
            captured_at: self.captured_at,
            source: raw.text("source").unwrap_or_else(|| self.source.clone()),
            payload: Payload::Product(Product {
                keyword: self.keyword.clone(),
                title: raw.text("title"),
                price,
                currency: "JPY".to_string(),
                availability,
                url,
                image_url: raw.text("image_url"),
            }),
            key: asin,
        })
    }
}

pub struct MessageNormalizer {
    /// Display name; the raw record only carries the channel id.
    pub channel: String,
    pub captured_at: DateTime<FixedOffset>,
}

impl Normalizer for MessageNormalizer {
    fn normalize(&self, raw: &RawRecord, rank: usize) -> Result<CanonicalRecord, RecordSkipped> {
        let ts = raw
            .text("ts")
            .ok_or_else(|| RecordSkipped::new("normalize", None, "message without ts"))?;
        let position = Cursor::parse(&ts).ok_or_else(|| {
            RecordSkipped::new("normalize", Some(&ts), "ts is not a timestamp")
        })?;

        Ok(CanonicalRecord {
            rank,
            position,
            captured_at: self.captured_at,
            source: "slack".to_string(),
            payload: Payload::Message(Message {
                channel: self.channel.clone(),
                user: raw.text("user").unwrap_or_else(|| "unknown".to_string()),
                text: raw.text("text"),
                permalink: raw.text("permalink"),
            }),
            key: ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn jst() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 15, 9, 30, 0)
            .unwrap()
    }

    fn products() -> ProductNormalizer {
        ProductNormalizer {
            keyword: Some("mouse".into()),
            source: "amazon_search".into(),
            captured_at: jst(),
        }
    }

    fn raw(v: serde_json::Value) -> RawRecord {
        RawRecord::from_value(v).unwrap()
    }

    fn product(r: &CanonicalRecord) -> &Product {
        match &r.payload {
            Payload::Product(p) => p,
            other => panic!("expected product, got {:?}", other),
        }
    }

    #[test]
    fn price_digits_only() {
        assert_eq!(extract_price("¥3,520"), Some(3520));
        assert_eq!(extract_price("￥1,980 - ￥2,480"), Some(1980));
        assert_eq!(extract_price("3,520."), Some(3520));
        assert_eq!(extract_price("価格なし"), None);
        assert_eq!(extract_price(""), None);
    }

    #[test]
    fn yen_price_is_stripped() {
        let r = products()
            .normalize(&raw(json!({"asin": "B001", "price_text": "¥3,520"})), 1)
            .unwrap();
        assert_eq!(product(&r).price, Some(3520));
        assert_eq!(product(&r).currency, "JPY");
    }

    #[test]
    fn missing_title_is_absent_not_error() {
        let r = products()
            .normalize(&raw(json!({"asin": "B002", "price_text": ""})), 3)
            .unwrap();
        let p = product(&r);
        assert_eq!(p.title, None);
        assert_eq!(p.price, None);
        assert_eq!(r.rank, 3);
        // URL is rebuilt from the ASIN
        assert_eq!(p.url.as_deref(), Some("https://www.amazon.co.jp/dp/B002"));
        assert_eq!(r.source, "amazon_search");
    }

    #[test]
    fn missing_asin_is_skipped() {
        let err = products()
            .normalize(&raw(json!({"title": "x"})), 1)
            .unwrap_err();
        assert_eq!(err.stage, "normalize");
    }

    #[test]
    fn availability_mapping() {
        assert_eq!(map_availability("在庫あり。"), Availability::InStock);
        assert_eq!(map_availability("通常配送無料"), Availability::InStock);
        assert_eq!(map_availability("一時的に在庫切れ"), Availability::OutOfStock);
        assert_eq!(map_availability("入荷予定あり"), Availability::Unknown);
        assert_eq!(map_availability(""), Availability::Unknown);

        let r = products()
            .normalize(
                &raw(json!({"asin": "B003", "availability_text": "在庫切れ", "source": "amazon_jp"})),
                1,
            )
            .unwrap();
        assert_eq!(product(&r).availability, Availability::OutOfStock);
        assert_eq!(r.source, "amazon_jp");
    }

    #[test]
    fn message_fields() {
        let n = MessageNormalizer {
            channel: "general".into(),
            captured_at: jst(),
        };
        let r = n
            .normalize(&raw(json!({"ts": "1726752000.000100", "text": "hi"})), 1)
            .unwrap();
        assert_eq!(r.key, "1726752000.000100");
        assert_eq!(r.position, Cursor::parse("1726752000.000100").unwrap());
        match &r.payload {
            Payload::Message(m) => {
                assert_eq!(m.user, "unknown");
                assert_eq!(m.text.as_deref(), Some("hi"));
                assert_eq!(m.permalink, None);
                assert_eq!(m.channel, "general");
            }
            other => panic!("expected message, got {:?}", other),
        }

        assert!(n.normalize(&raw(json!({"ts": "soon"})), 1).is_err());
    }
}
