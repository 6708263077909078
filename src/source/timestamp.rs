use bson::oid::ObjectId;
use bson::Bson;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::{SourceError, SourceResult};

/// Fallback layouts tried after RFC 3339 for string timestamps
const FALLBACK_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Normalize the universe of source timestamp encodings to a single type.
///
/// Accepts native BSON datetimes, integer and float epoch seconds, RFC 3339
/// strings and two legacy layouts. Anything else is an error the caller must
/// surface; the pipeline never advances the high-water mark past a document
/// whose timestamp it cannot read.
pub fn parse_timestamp(value: &Bson) -> SourceResult<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Ok(dt.to_chrono()),
        Bson::Int32(secs) => epoch_seconds(*secs as i64),
        Bson::Int64(secs) => epoch_seconds(*secs),
        Bson::Double(secs) => epoch_seconds(*secs as i64),
        Bson::String(s) => parse_timestamp_str(s),
        other => Err(SourceError::UnsupportedTimestamp(format!(
            "unsupported type: {:?}",
            other.element_type()
        ))),
    }
}

fn epoch_seconds(secs: i64) -> SourceResult<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SourceError::UnsupportedTimestamp(format!("epoch out of range: {}", secs)))
}

fn parse_timestamp_str(s: &str) -> SourceResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in FALLBACK_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(SourceError::UnsupportedTimestamp(format!(
        "unable to parse timestamp string: {}",
        s
    )))
}

/// Build the smallest ObjectId whose embedded creation time is `t`, used as
/// an exclusive lower bound for `_id`-ordered polling.
pub fn objectid_after(t: DateTime<Utc>) -> ObjectId {
    let secs = t.timestamp().clamp(0, u32::MAX as i64) as u32;
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&secs.to_be_bytes());
    ObjectId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_native_datetime() {
        let now = Utc::now();
        let bson = Bson::DateTime(bson::DateTime::from_chrono(now));
        let parsed = parse_timestamp(&bson).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_parse_integer_epoch() {
        let parsed = parse_timestamp(&Bson::Int64(1_700_000_000)).unwrap();
        assert_eq!(parsed.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_float_epoch_truncates() {
        let parsed = parse_timestamp(&Bson::Double(1_700_000_000.75)).unwrap();
        assert_eq!(parsed.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_rfc3339() {
        let parsed =
            parse_timestamp(&Bson::String("2024-03-01T12:30:00+02:00".to_string())).unwrap();
        assert_eq!(parsed.timestamp(), 1_709_289_000);
    }

    #[test]
    fn test_parse_fallback_layouts() {
        for s in ["2024-03-01T10:30:00Z", "2024-03-01T10:30:00", "2024-03-01 10:30:00"] {
            let parsed = parse_timestamp(&Bson::String(s.to_string())).unwrap();
            assert_eq!(parsed.timestamp(), 1_709_289_000, "layout: {}", s);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_string() {
        assert!(parse_timestamp(&Bson::String("yesterday".to_string())).is_err());
    }

    #[test]
    fn test_parse_rejects_unsupported_type() {
        assert!(parse_timestamp(&Bson::Boolean(true)).is_err());
    }

    #[test]
    fn test_objectid_after_embeds_timestamp() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let oid = objectid_after(t);
        assert_eq!(oid.timestamp().to_chrono().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_objectid_after_orders_by_time() {
        let early = objectid_after(Utc.timestamp_opt(1_000_000, 0).single().unwrap());
        let late = objectid_after(Utc.timestamp_opt(2_000_000, 0).single().unwrap());
        assert!(early < late);
    }
}
