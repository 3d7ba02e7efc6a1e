//! Canonicalisation of fetched records into a comparison-stable shape.
//!
//! Everything here is a pure function from [`serde_json::Value`] to a new
//! `Value`; nothing mutates in place. The same canonical form is produced at
//! export time (before the record is persisted) and at verify time (on both
//! the persisted file and the refetched record), so a bit-for-bit comparison
//! only sees differences that are real.
//!
//! The transformations are:
//! - strip `resourceVersion` (changes whenever downstream systems annotate a
//!   record after creation)
//! - flatten coded `value` references (`{"uuid": "…"}`) to the bare uuid
//!   string, and drop explicit null values — the REST API rejects both the
//!   rich form and the explicit null on write
//! - default null `groupMembers` to `[]` (the API is not null-safe there)
//! - canonicalise timestamps that fall exactly at local midnight or one
//!   second before it (see [`canonicalize_datetime`])
//! - sort uuid-keyed collections so comparison is independent of the
//!   server's return order

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

/// Canonicalise a single ISO-8601 timestamp string.
///
/// Timestamps at exactly local midnight are artifacts of date-only events
/// round-tripped through unknown timezone handling, so the time component is
/// dropped entirely. Timestamps at exactly one second before local midnight
/// (the other common artifact, from exclusive end-of-day ranges) keep their
/// wall-clock time but lose the timezone designator.
///
/// Returns `None` when the string is not an ISO-8601 timestamp or needs no
/// change:
///
/// - `2020-06-01T00:00:00Z` → `2020-06-01`
/// - `2020-06-01T23:59:59-04:00` → `2020-06-01T23:59:59`
/// - `2020-06-01T08:15:00Z` → unchanged
pub fn canonicalize_datetime(s: &str) -> Option<String> {
    let parts = IsoParts::parse(s)?;
    if parts.time == "00:00:00" && parts.frac_is_zero() {
        return Some(parts.date.to_string());
    }
    if parts.time == "23:59:59" && (!parts.offset.is_empty() || !parts.frac.is_empty()) {
        return Some(format!("{}T23:59:59", parts.date));
    }
    None
}

/// Canonicalise a full record: dates, coded values, collection order.
///
/// This is a fixed point: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => normalize_object(map),
        Value::Array(items) => normalize_array(items),
        Value::String(s) => match canonicalize_datetime(s) {
            Some(canonical) => Value::String(canonical),
            None => value.clone(),
        },
        other => other.clone(),
    }
}

fn normalize_object(map: &Map<String, Value>) -> Value {
    let has_complex_value = map
        .get("valueComplex")
        .is_some_and(|complex| !complex.is_null());

    let mut result = Map::new();
    for (key, entry) in map {
        match key.as_str() {
            // varies when the record is annotated after creation
            "resourceVersion" => continue,
            "value" => {
                // complex data is copied out of band, never via REST
                if has_complex_value {
                    continue;
                }
                match entry {
                    Value::Null => continue,
                    Value::Object(inner) => match inner.get("uuid") {
                        Some(Value::String(uuid)) => {
                            result.insert(key.clone(), Value::String(uuid.clone()));
                        }
                        _ => {
                            result.insert(key.clone(), normalize(entry));
                        }
                    },
                    _ => {
                        result.insert(key.clone(), normalize(entry));
                    }
                }
            }
            "groupMembers" if entry.is_null() => {
                result.insert(key.clone(), Value::Array(Vec::new()));
            }
            _ => {
                result.insert(key.clone(), normalize(entry));
            }
        }
    }
    Value::Object(result)
}

fn normalize_array(items: &[Value]) -> Value {
    let mut normalized: Vec<Value> = items.iter().map(normalize).collect();
    if normalized.len() > 1 && normalized.iter().all(has_uuid_key) {
        sort_by_uuid(&mut normalized);
    }
    Value::Array(normalized)
}

fn has_uuid_key(value: &Value) -> bool {
    value.get("uuid").and_then(Value::as_str).is_some()
}

/// Sort a uuid-keyed collection in place by uuid.
pub fn sort_by_uuid(values: &mut [Value]) {
    values.sort_by(|a, b| {
        let a = a.get("uuid").and_then(Value::as_str).unwrap_or("");
        let b = b.get("uuid").and_then(Value::as_str).unwrap_or("");
        a.cmp(b)
    });
}

/// Shift 2016 Haiti timestamps into the daylight-saving window.
///
/// Haiti suspended daylight-saving in 2016 while the source server's
/// timezone database still applied it, so wall-clock times recorded between
/// the second Sunday of March and the first Sunday of November 2016 are one
/// hour behind what the target reports. Applied during verification only,
/// behind a configuration flag.
pub fn shift_haiti_2016(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), shift_haiti_2016(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(shift_haiti_2016).collect()),
        Value::String(s) => Value::String(shift_haiti_2016_str(s)),
        other => other.clone(),
    }
}

fn shift_haiti_2016_str(s: &str) -> String {
    let Some(parts) = IsoParts::parse(s) else {
        return s.to_string();
    };
    let Ok(naive) = NaiveDateTime::parse_from_str(
        &format!("{}T{}", parts.date, parts.time),
        "%Y-%m-%dT%H:%M:%S",
    ) else {
        return s.to_string();
    };
    // US DST window for 2016: 2016-03-13 02:00 to 2016-11-06 02:00
    let window_start = NaiveDate::from_ymd_opt(2016, 3, 13)
        .and_then(|d| d.and_hms_opt(2, 0, 0))
        .unwrap_or_default();
    let window_end = NaiveDate::from_ymd_opt(2016, 11, 6)
        .and_then(|d| d.and_hms_opt(2, 0, 0))
        .unwrap_or_default();
    if naive < window_start || naive >= window_end {
        return s.to_string();
    }
    let shifted = naive + Duration::hours(1);
    format!(
        "{}{}{}",
        shifted.format("%Y-%m-%dT%H:%M:%S"),
        parts.frac,
        parts.offset
    )
}

/// The pieces of an ISO-8601 timestamp: `date`T`time``frac``offset`.
struct IsoParts<'a> {
    date: &'a str,
    time: &'a str,
    frac: &'a str,
    offset: &'a str,
}

impl<'a> IsoParts<'a> {
    /// Strict structural parse; rejects anything that is not
    /// `YYYY-MM-DDTHH:MM:SS` followed by an optional fraction and an
    /// optional `Z` / `±HH:MM` / `±HHMM` offset.
    fn parse(s: &'a str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() < 19 {
            return None;
        }
        let datelike = |i: usize| bytes[i].is_ascii_digit();
        let structure_ok = datelike(0)
            && datelike(1)
            && datelike(2)
            && datelike(3)
            && bytes[4] == b'-'
            && datelike(5)
            && datelike(6)
            && bytes[7] == b'-'
            && datelike(8)
            && datelike(9)
            && bytes[10] == b'T'
            && datelike(11)
            && datelike(12)
            && bytes[13] == b':'
            && datelike(14)
            && datelike(15)
            && bytes[16] == b':'
            && datelike(17)
            && datelike(18);
        if !structure_ok {
            return None;
        }

        let date = &s[..10];
        let time = &s[11..19];
        let mut rest = &s[19..];

        let mut frac = "";
        if rest.starts_with('.') {
            let digits = rest[1..]
                .bytes()
                .take_while(|b| b.is_ascii_digit())
                .count();
            if digits == 0 {
                return None;
            }
            frac = &rest[..1 + digits];
            rest = &rest[1 + digits..];
        }

        let offset = match rest.as_bytes() {
            [] => "",
            [b'Z'] => rest,
            [b'+' | b'-', rest_bytes @ ..] => {
                let digits_ok = match rest_bytes {
                    [h1, h2, m1, m2] => [h1, h2, m1, m2].iter().all(|b| b.is_ascii_digit()),
                    [h1, h2, b':', m1, m2] => [h1, h2, m1, m2].iter().all(|b| b.is_ascii_digit()),
                    _ => false,
                };
                if !digits_ok {
                    return None;
                }
                rest
            }
            _ => return None,
        };

        Some(Self {
            date,
            time,
            frac,
            offset,
        })
    }

    fn frac_is_zero(&self) -> bool {
        self.frac.bytes().skip(1).all(|b| b == b'0')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_midnight_becomes_date_only() {
        assert_eq!(
            canonicalize_datetime("2020-06-01T00:00:00Z"),
            Some("2020-06-01".to_string())
        );
        assert_eq!(
            canonicalize_datetime("2020-06-01T00:00:00.000-0500"),
            Some("2020-06-01".to_string())
        );
        assert_eq!(
            canonicalize_datetime("2020-06-01T00:00:00"),
            Some("2020-06-01".to_string())
        );
    }

    #[test]
    fn test_second_before_midnight_loses_timezone() {
        assert_eq!(
            canonicalize_datetime("2020-06-01T23:59:59-04:00"),
            Some("2020-06-01T23:59:59".to_string())
        );
        assert_eq!(
            canonicalize_datetime("2020-06-01T23:59:59.000+0100"),
            Some("2020-06-01T23:59:59".to_string())
        );
        // already canonical
        assert_eq!(canonicalize_datetime("2020-06-01T23:59:59"), None);
    }

    #[test]
    fn test_ordinary_timestamps_unchanged() {
        assert_eq!(canonicalize_datetime("2020-06-01T08:15:00Z"), None);
        assert_eq!(canonicalize_datetime("2020-06-01T00:00:01Z"), None);
        assert_eq!(canonicalize_datetime("2020-06-01T00:00:00.500Z"), None);
    }

    #[test]
    fn test_non_timestamps_unchanged() {
        assert_eq!(canonicalize_datetime("not a date"), None);
        assert_eq!(canonicalize_datetime("2020-06-01"), None);
        assert_eq!(canonicalize_datetime("2020-06-01T00:00"), None);
        assert_eq!(canonicalize_datetime("2020-06-01T00:00:00X"), None);
    }

    #[test]
    fn test_coded_value_flattened_to_uuid() {
        let obs = json!({"uuid": "o1", "value": {"uuid": "concept-1"}});
        let normalized = normalize(&obs);
        assert_eq!(normalized["value"], json!("concept-1"));
    }

    #[test]
    fn test_null_value_dropped() {
        let obs = json!({"uuid": "o1", "value": null});
        let normalized = normalize(&obs);
        assert!(normalized.get("value").is_none());
    }

    #[test]
    fn test_value_dropped_when_complex_present() {
        let obs = json!({"uuid": "o1", "value": "raw bytes", "valueComplex": "instructions"});
        let normalized = normalize(&obs);
        assert!(normalized.get("value").is_none());
        assert_eq!(normalized["valueComplex"], json!("instructions"));
    }

    #[test]
    fn test_null_group_members_become_empty_list() {
        let obs = json!({"uuid": "o1", "groupMembers": null});
        let normalized = normalize(&obs);
        assert_eq!(normalized["groupMembers"], json!([]));
    }

    #[test]
    fn test_group_members_normalized_recursively() {
        let obs = json!({
            "uuid": "o1",
            "groupMembers": [
                {"uuid": "m1", "value": {"uuid": "c1"}, "groupMembers": null}
            ]
        });
        let normalized = normalize(&obs);
        assert_eq!(normalized["groupMembers"][0]["value"], json!("c1"));
        assert_eq!(normalized["groupMembers"][0]["groupMembers"], json!([]));
    }

    #[test]
    fn test_resource_version_stripped_at_any_depth() {
        let record = json!({
            "uuid": "p1",
            "resourceVersion": "1.9",
            "person": {"uuid": "per1", "resourceVersion": "2.0"}
        });
        let normalized = normalize(&record);
        assert!(normalized.get("resourceVersion").is_none());
        assert!(normalized["person"].get("resourceVersion").is_none());
    }

    #[test]
    fn test_uuid_collections_sorted() {
        let record = json!({"visits": [{"uuid": "b"}, {"uuid": "a"}, {"uuid": "c"}]});
        let normalized = normalize(&record);
        assert_eq!(
            normalized["visits"],
            json!([{"uuid": "a"}, {"uuid": "b"}, {"uuid": "c"}])
        );
    }

    #[test]
    fn test_non_uuid_arrays_keep_order() {
        let record = json!({"roles": ["z", "a"]});
        let normalized = normalize(&record);
        assert_eq!(normalized["roles"], json!(["z", "a"]));
    }

    #[test]
    fn test_normalize_is_a_fixed_point() {
        let record = json!({
            "uuid": "p1",
            "resourceVersion": "1.9",
            "dateCreated": "2020-06-01T00:00:00.000-0500",
            "visits": [
                {"uuid": "v2", "startDatetime": "2019-02-03T23:59:59-05:00"},
                {"uuid": "v1", "startDatetime": "2019-02-03T08:15:00-05:00"}
            ],
            "encounters": [{
                "uuid": "e1",
                "obs": [{"uuid": "o1", "value": {"uuid": "c1"}, "groupMembers": null}]
            }]
        });
        let once = normalize(&record);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_haiti_2016_shift_inside_window() {
        let value = json!({"encounterDatetime": "2016-06-01T10:30:00.000-0500"});
        let shifted = shift_haiti_2016(&value);
        assert_eq!(
            shifted["encounterDatetime"],
            json!("2016-06-01T11:30:00.000-0500")
        );
    }

    #[test]
    fn test_haiti_2016_shift_outside_window() {
        let winter = json!({"encounterDatetime": "2016-01-15T10:30:00.000-0500"});
        assert_eq!(shift_haiti_2016(&winter), winter);
        let other_year = json!({"encounterDatetime": "2017-06-01T10:30:00.000-0500"});
        assert_eq!(shift_haiti_2016(&other_year), other_year);
    }
}
