//! Core domain model and normalization logic for WOB.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "wob-core";

/// One raw row from the warehouse source. Column names are whatever the
/// external system happens to expose; any superset of the alias tables
/// below is acceptable.
pub type RawRecord = serde_json::Map<String, JsonValue>;

// Ordered alias tables, highest priority first. The warehouse schema has
// drifted over the years, so every logical attribute carries the full
// history of column names it has been seen under.
pub const ORDER_KEY_ALIASES: &[&str] = &["NarID", "NarId", "OrderKey", "OrderGuid", "Id"];
pub const NUMERIC_ORDER_ID_ALIASES: &[&str] = &["NarIntID", "OrderIntId", "OrderID"];
pub const ORDER_TYPE_CODE_ALIASES: &[&str] = &["OrderType", "NarTyp", "DocumentType", "Type"];
pub const ORDER_NUMBER_ALIASES: &[&str] = &["OrderNumber", "NarNr", "DocumentNumber", "Number"];
pub const CUSTOMER_CODE_ALIASES: &[&str] = &["CustomerCode", "ClientCode", "KntCode"];
pub const CUSTOMER_NAME_ALIASES: &[&str] = &["CustomerName", "ClientName", "KntName", "Customer"];
pub const IMPORTER_ALIASES: &[&str] = &["Importer", "ImporterName"];
pub const ARTICLE_ALIASES: &[&str] = &["Article", "ArticleCode", "ItemCode"];
pub const ARTICLE_DESCRIPTION_ALIASES: &[&str] =
    &["ArticleDescription", "ArticleName", "ItemName"];
pub const ARTICLE_COUNT_ALIASES: &[&str] = &["ArticleCount", "Articles", "Quantity", "Qty"];
pub const BOX_COUNT_ALIASES: &[&str] = &["BoxCount", "Boxes", "CartonCount", "Cartons"];
pub const PALLET_COUNT_ALIASES: &[&str] = &["PalletCount", "Pallets", "PalletQty"];
pub const ORDER_DATE_ALIASES: &[&str] = &["OrderDate", "DocumentDate", "CreatedDate"];
pub const ARRIVAL_DATE_ALIASES: &[&str] =
    &["ArrivalDate", "DeliveryDate", "ExpectedDate", "ETA"];
pub const IS_REALIZED_ALIASES: &[&str] = &["IsRealized", "Realized", "RealizedFlag"];
pub const ORDER_STATUS_ALIASES: &[&str] = &["OrderStatus", "Status", "NarStatus"];
pub const COMMENT_ALIASES: &[&str] = &["Comment", "Description", "Remarks", "Notes"];
pub const SOURCE_REFERENCE_ALIASES: &[&str] = &["SourceReference", "SourceRef", "ExternalRef"];
pub const SOURCE_UPDATED_AT_ALIASES: &[&str] =
    &["SourceUpdatedAt", "ModifiedAt", "LastModified", "TS_M"];
pub const SCHEDULED_START_ALIASES: &[&str] = &["ScheduledStart", "PlannedStart", "SlotStart"];
pub const ORIGINAL_ORDER_NUMBER_ALIASES: &[&str] =
    &["OriginalOrderNumber", "OrigOrderNumber", "OrigNr"];
pub const CAN_PROCEED_ALIASES: &[&str] = &["CanProceed", "Proceed", "Released"];

// Destination column bounds. Oversized values are truncated during
// normalization, never rejected.
pub const MAX_ORDER_KEY: usize = 50;
pub const MAX_ORDER_TYPE_CODE: usize = 20;
pub const MAX_ORDER_NUMBER: usize = 50;
pub const MAX_CUSTOMER_CODE: usize = 50;
pub const MAX_CUSTOMER_NAME: usize = 255;
pub const MAX_IMPORTER: usize = 255;
pub const MAX_ARTICLE: usize = 50;
pub const MAX_ARTICLE_DESCRIPTION: usize = 255;
pub const MAX_IS_REALIZED: usize = 10;
pub const MAX_ORDER_STATUS: usize = 20;
pub const MAX_COMMENT: usize = 1000;
pub const MAX_SOURCE_REFERENCE: usize = 100;
pub const MAX_ORIGINAL_ORDER_NUMBER: usize = 50;

/// Canonical pending-order representation, keyed by `order_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_key: String,
    pub numeric_order_id: Option<i64>,
    pub order_type_code: Option<String>,
    pub order_number: Option<String>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub importer: Option<String>,
    pub article: Option<String>,
    pub article_description: Option<String>,
    pub article_count: Option<f64>,
    pub box_count: Option<f64>,
    pub pallet_count: Option<f64>,
    pub order_date: Option<DateTime<Utc>>,
    pub arrival_date: DateTime<Utc>,
    /// Always equal to `arrival_date`; the pipeline does not track the
    /// two independently.
    pub expected_date: DateTime<Utc>,
    pub is_realized: Option<String>,
    pub order_status: Option<String>,
    pub comment: Option<String>,
    pub source_reference: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub original_order_number: Option<String>,
    pub can_proceed: Option<bool>,
}

fn truncate_chars(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}

/// First alias present with a non-empty textual value, trimmed and
/// truncated to `max_len`. Numeric values are stringified; the warehouse
/// exports numeric codes for several nominally-text columns.
pub fn resolve_string(record: &RawRecord, aliases: &[&str], max_len: usize) -> Option<String> {
    for alias in aliases {
        match record.get(*alias) {
            Some(JsonValue::String(raw)) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return Some(truncate_chars(trimmed, max_len));
                }
            }
            Some(JsonValue::Number(n)) => {
                return Some(truncate_chars(&n.to_string(), max_len));
            }
            _ => {}
        }
    }
    None
}

fn parse_numeric_text(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', ".");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// First alias resolving to a finite number. Numeric strings are accepted
/// with either `.` or `,` as the decimal separator; non-finite values are
/// treated as absent and iteration continues.
pub fn resolve_number(record: &RawRecord, aliases: &[&str]) -> Option<f64> {
    for alias in aliases {
        match record.get(*alias) {
            Some(JsonValue::Number(n)) => {
                if let Some(v) = n.as_f64().filter(|v| v.is_finite()) {
                    return Some(v);
                }
            }
            Some(JsonValue::String(raw)) => {
                if let Some(v) = parse_numeric_text(raw) {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// First alias resolving to an integral value.
pub fn resolve_integer(record: &RawRecord, aliases: &[&str]) -> Option<i64> {
    for alias in aliases {
        match record.get(*alias) {
            Some(JsonValue::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return Some(v);
                }
                if let Some(f) = n.as_f64() {
                    if f.is_finite() && f.fract() == 0.0 {
                        return Some(f as i64);
                    }
                }
            }
            Some(JsonValue::String(raw)) => {
                if let Ok(v) = raw.trim().parse::<i64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_datetime_text(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// First alias resolving to a parseable datetime. Unparsable values are
/// treated as absent and iteration continues to the next alias.
pub fn resolve_date(record: &RawRecord, aliases: &[&str]) -> Option<DateTime<Utc>> {
    for alias in aliases {
        if let Some(JsonValue::String(raw)) = record.get(*alias) {
            if let Some(parsed) = parse_datetime_text(raw) {
                return Some(parsed);
            }
        }
    }
    None
}

/// First alias resolving to a recognizable boolean. The warehouse encodes
/// flags as bits, 0/1 numbers, and assorted y/n text.
pub fn resolve_flag(record: &RawRecord, aliases: &[&str]) -> Option<bool> {
    for alias in aliases {
        match record.get(*alias) {
            Some(JsonValue::Bool(b)) => return Some(*b),
            Some(JsonValue::Number(n)) => match n.as_i64() {
                Some(0) => return Some(false),
                Some(1) => return Some(true),
                _ => {}
            },
            Some(JsonValue::String(raw)) => {
                match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "t" | "y" | "yes" | "true" => return Some(true),
                    "0" | "f" | "n" | "no" | "false" => return Some(false),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    None
}

/// Quantities pulled out of a free-text comment via `#label: number`
/// annotations. These override the structured columns when present.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InlineMetrics {
    pub article_count: Option<f64>,
    pub pallet_count: Option<f64>,
    pub box_count: Option<f64>,
}

static INLINE_METRIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#([A-Za-z]+)\s*:\s*([0-9]+(?:[.,][0-9]+)?)").expect("inline metric pattern")
});

/// Scan free text for `#art: 12`, `#pal: 3`, `#box: 40,5` style
/// annotations. Label matching is a case-insensitive prefix check; the
/// last occurrence of a given label class wins.
pub fn extract_inline_metrics(text: Option<&str>) -> InlineMetrics {
    let mut metrics = InlineMetrics::default();
    let Some(text) = text else {
        return metrics;
    };
    for capture in INLINE_METRIC_RE.captures_iter(text) {
        let label = capture[1].to_ascii_lowercase();
        let Some(value) = parse_numeric_text(&capture[2]) else {
            continue;
        };
        if label.starts_with("art") {
            metrics.article_count = Some(value);
        } else if label.starts_with("pal") {
            metrics.pallet_count = Some(value);
        } else if label.starts_with("box") {
            metrics.box_count = Some(value);
        }
    }
    metrics
}

/// Turn one raw warehouse row into a canonical [`Order`].
///
/// Returns `None` when the row has no resolvable order key or arrival
/// date. That is a filtering outcome, not an error: the warehouse feed
/// routinely carries half-filled rows that must never reach storage.
pub fn normalize(record: &RawRecord) -> Option<Order> {
    let order_key = resolve_string(record, ORDER_KEY_ALIASES, MAX_ORDER_KEY)?;
    let arrival_date = resolve_date(record, ARRIVAL_DATE_ALIASES)?;

    let customer_name = resolve_string(record, CUSTOMER_NAME_ALIASES, MAX_CUSTOMER_NAME);
    let importer = resolve_string(record, IMPORTER_ALIASES, MAX_IMPORTER)
        .or_else(|| customer_name.clone());

    let comment = resolve_string(record, COMMENT_ALIASES, MAX_COMMENT);
    let inline = extract_inline_metrics(comment.as_deref());

    Some(Order {
        order_key,
        numeric_order_id: resolve_integer(record, NUMERIC_ORDER_ID_ALIASES),
        order_type_code: resolve_string(record, ORDER_TYPE_CODE_ALIASES, MAX_ORDER_TYPE_CODE),
        order_number: resolve_string(record, ORDER_NUMBER_ALIASES, MAX_ORDER_NUMBER),
        customer_code: resolve_string(record, CUSTOMER_CODE_ALIASES, MAX_CUSTOMER_CODE),
        customer_name,
        importer,
        article: resolve_string(record, ARTICLE_ALIASES, MAX_ARTICLE),
        article_description: resolve_string(
            record,
            ARTICLE_DESCRIPTION_ALIASES,
            MAX_ARTICLE_DESCRIPTION,
        ),
        article_count: inline
            .article_count
            .or_else(|| resolve_number(record, ARTICLE_COUNT_ALIASES)),
        box_count: inline
            .box_count
            .or_else(|| resolve_number(record, BOX_COUNT_ALIASES)),
        pallet_count: inline
            .pallet_count
            .or_else(|| resolve_number(record, PALLET_COUNT_ALIASES)),
        order_date: resolve_date(record, ORDER_DATE_ALIASES),
        arrival_date,
        expected_date: arrival_date,
        is_realized: resolve_string(record, IS_REALIZED_ALIASES, MAX_IS_REALIZED),
        order_status: resolve_string(record, ORDER_STATUS_ALIASES, MAX_ORDER_STATUS),
        comment,
        source_reference: resolve_string(record, SOURCE_REFERENCE_ALIASES, MAX_SOURCE_REFERENCE),
        source_updated_at: resolve_date(record, SOURCE_UPDATED_AT_ALIASES),
        scheduled_start: resolve_date(record, SCHEDULED_START_ALIASES),
        original_order_number: resolve_string(
            record,
            ORIGINAL_ORDER_NUMBER_ALIASES,
            MAX_ORIGINAL_ORDER_NUMBER,
        ),
        can_proceed: resolve_flag(record, CAN_PROCEED_ALIASES),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        value.as_object().expect("object literal").clone()
    }

    #[test]
    fn resolve_string_honors_alias_priority_not_key_order() {
        let rec = record(json!({
            "NarNr": "ZN-OLD",
            "OrderNumber": "ZN-NEW",
        }));
        assert_eq!(
            resolve_string(&rec, ORDER_NUMBER_ALIASES, MAX_ORDER_NUMBER),
            Some("ZN-NEW".to_string())
        );
    }

    #[test]
    fn resolve_string_skips_blank_and_null_values() {
        let rec = record(json!({
            "OrderNumber": "   ",
            "NarNr": null,
            "DocumentNumber": "  DOC-7 ",
        }));
        assert_eq!(
            resolve_string(&rec, ORDER_NUMBER_ALIASES, MAX_ORDER_NUMBER),
            Some("DOC-7".to_string())
        );
    }

    #[test]
    fn resolve_string_truncates_instead_of_rejecting() {
        let rec = record(json!({ "CustomerName": "x".repeat(300) }));
        let resolved = resolve_string(&rec, CUSTOMER_NAME_ALIASES, MAX_CUSTOMER_NAME).unwrap();
        assert_eq!(resolved.chars().count(), MAX_CUSTOMER_NAME);
    }

    #[test]
    fn resolve_string_stringifies_numeric_codes() {
        let rec = record(json!({ "Status": 3 }));
        assert_eq!(
            resolve_string(&rec, ORDER_STATUS_ALIASES, MAX_ORDER_STATUS),
            Some("3".to_string())
        );
    }

    #[test]
    fn resolve_number_accepts_decimal_comma_strings() {
        let rec = record(json!({ "ArticleCount": "12,75" }));
        assert_eq!(resolve_number(&rec, ARTICLE_COUNT_ALIASES), Some(12.75));
    }

    #[test]
    fn resolve_number_falls_past_unparseable_aliases() {
        let rec = record(json!({
            "ArticleCount": "n/a",
            "Quantity": 8,
        }));
        assert_eq!(resolve_number(&rec, ARTICLE_COUNT_ALIASES), Some(8.0));
    }

    #[test]
    fn resolve_date_accepts_common_warehouse_formats() {
        for raw in [
            "2024-05-01T08:30:00Z",
            "2024-05-01T08:30:00",
            "2024-05-01 08:30:00",
        ] {
            let rec = record(json!({ "ArrivalDate": raw }));
            let parsed = resolve_date(&rec, ARRIVAL_DATE_ALIASES).expect(raw);
            assert_eq!(parsed.to_rfc3339(), "2024-05-01T08:30:00+00:00");
        }
        let rec = record(json!({ "ArrivalDate": "2024-05-01" }));
        assert!(resolve_date(&rec, ARRIVAL_DATE_ALIASES).is_some());
    }

    #[test]
    fn resolve_date_skips_garbage_and_continues() {
        let rec = record(json!({
            "ArrivalDate": "soon",
            "DeliveryDate": "2024-06-02",
        }));
        let parsed = resolve_date(&rec, ARRIVAL_DATE_ALIASES).unwrap();
        assert_eq!(parsed.date_naive().to_string(), "2024-06-02");
    }

    #[test]
    fn resolve_flag_understands_bit_and_text_forms() {
        for (raw, expected) in [
            (json!({ "CanProceed": true }), Some(true)),
            (json!({ "CanProceed": 0 }), Some(false)),
            (json!({ "CanProceed": "Y" }), Some(true)),
            (json!({ "CanProceed": "no" }), Some(false)),
            (json!({ "CanProceed": "maybe" }), None),
            (json!({}), None),
        ] {
            assert_eq!(
                resolve_flag(&record(raw.clone()), CAN_PROCEED_ALIASES),
                expected,
                "{raw}"
            );
        }
    }

    #[test]
    fn inline_metrics_classify_by_label_prefix() {
        let metrics =
            extract_inline_metrics(Some("ramp 4 #Articles: 120,5 #pal: 3 #BOX:40 trailer"));
        assert_eq!(metrics.article_count, Some(120.5));
        assert_eq!(metrics.pallet_count, Some(3.0));
        assert_eq!(metrics.box_count, Some(40.0));
    }

    #[test]
    fn inline_metrics_last_occurrence_wins() {
        let metrics = extract_inline_metrics(Some("#art: 10 corrected later #art: 25"));
        assert_eq!(metrics.article_count, Some(25.0));
    }

    #[test]
    fn inline_metrics_tolerate_empty_and_unlabeled_text() {
        assert_eq!(extract_inline_metrics(None), InlineMetrics::default());
        assert_eq!(extract_inline_metrics(Some("")), InlineMetrics::default());
        assert_eq!(
            extract_inline_metrics(Some("no annotations here, just #words")),
            InlineMetrics::default()
        );
    }

    #[test]
    fn normalize_rejects_rows_without_an_order_key() {
        let rec = record(json!({ "Comment": "hello" }));
        assert!(normalize(&rec).is_none());
    }

    #[test]
    fn normalize_rejects_rows_without_an_arrival_date() {
        let rec = record(json!({ "NarID": "X9", "Comment": "key but no date" }));
        assert!(normalize(&rec).is_none());
    }

    #[test]
    fn normalize_extracts_inline_quantities_from_the_comment() {
        let rec = record(json!({
            "NarID": "X1",
            "ArrivalDate": "2024-05-01",
            "Comment": "#art: 120,5 #pal: 3",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.order_key, "X1");
        assert_eq!(order.arrival_date.date_naive().to_string(), "2024-05-01");
        assert_eq!(order.article_count, Some(120.5));
        assert_eq!(order.pallet_count, Some(3.0));
        assert_eq!(order.box_count, None);
    }

    #[test]
    fn normalize_prefers_inline_metrics_over_structured_columns() {
        let rec = record(json!({
            "NarID": "X2",
            "ArrivalDate": "2024-05-01",
            "ArticleCount": 999,
            "Comment": "#art: 17",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.article_count, Some(17.0));
    }

    #[test]
    fn normalize_keeps_structured_quantities_without_annotations() {
        let rec = record(json!({
            "NarID": "X3",
            "ArrivalDate": "2024-05-01",
            "ArticleCount": 999,
            "BoxCount": "12",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.article_count, Some(999.0));
        assert_eq!(order.box_count, Some(12.0));
    }

    #[test]
    fn normalize_falls_back_to_customer_name_for_importer() {
        let rec = record(json!({
            "NarID": "X4",
            "ArrivalDate": "2024-05-01",
            "CustomerName": "Baltic Freight Oy",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.importer.as_deref(), Some("Baltic Freight Oy"));

        let rec = record(json!({
            "NarID": "X5",
            "ArrivalDate": "2024-05-01",
            "CustomerName": "Baltic Freight Oy",
            "Importer": "Nordic Imports AB",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.importer.as_deref(), Some("Nordic Imports AB"));
    }

    #[test]
    fn normalize_mirrors_arrival_date_into_expected_date() {
        let rec = record(json!({
            "NarID": "X6",
            "DeliveryDate": "2024-07-15 06:00:00",
        }));
        let order = normalize(&rec).unwrap();
        assert_eq!(order.expected_date, order.arrival_date);
    }
}
