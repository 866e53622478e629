//! Bill statistics over a date range.
//!
//! Sums are carried in `Decimal` end to end; the float conversion happens
//! once, when the JSON body is assembled. The time series is gap-free: every
//! day/week/month boundary inside the range gets a bucket even when no bill
//! falls into it, so chart rendering never has to synthesize missing points.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::money;
use crate::repository::table_service::list_rows;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Day,
    Week,
    Month,
}

impl GroupBy {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "day" | "" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(AppError::BadRequest(format!(
                "Unknown group_by '{other}'. Expected day, week or month."
            ))),
        }
    }
}

/// Resolve explicit dates or a named preset into concrete bounds.
pub fn parse_date_range(
    start: Option<&str>,
    end: Option<&str>,
    range: Option<&str>,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), AppError> {
    let start = non_empty(start);
    let end = non_empty(end);

    if start.is_some() || end.is_some() {
        let (Some(start_raw), Some(end_raw)) = (start, end) else {
            return Err(AppError::BadRequest(
                "Both start and end are required for an explicit date range.".to_string(),
            ));
        };
        let start_date = parse_date(start_raw).ok_or_else(|| {
            AppError::BadRequest("Invalid start date. Expected YYYY-MM-DD.".to_string())
        })?;
        let end_date = parse_date(end_raw).ok_or_else(|| {
            AppError::BadRequest("Invalid end date. Expected YYYY-MM-DD.".to_string())
        })?;
        if start_date > end_date {
            return Err(AppError::BadRequest(
                "Invalid date range: start is after end.".to_string(),
            ));
        }
        return Ok((start_date, end_date));
    }

    let Some(preset) = non_empty(range) else {
        return Err(AppError::BadRequest(
            "Provide start/end dates or a range preset (today, week, month, quarter, year)."
                .to_string(),
        ));
    };

    let start_date = match preset.trim().to_ascii_lowercase().as_str() {
        "today" => today,
        "week" => today - Duration::days(today.weekday().num_days_from_monday() as i64),
        "month" => first_of_month(today),
        "quarter" => {
            let quarter_month = ((today.month0() / 3) * 3) + 1;
            NaiveDate::from_ymd_opt(today.year(), quarter_month, 1).unwrap_or(today)
        }
        "year" => NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
        other => {
            return Err(AppError::BadRequest(format!(
                "Unknown range preset '{other}'. Expected today, week, month, quarter or year."
            )))
        }
    };

    Ok((start_date, today))
}

/// The immediately preceding period of equal length.
pub fn preceding_period(start: NaiveDate, end: NaiveDate) -> (NaiveDate, NaiveDate) {
    let length = end - start;
    let previous_end = start - Duration::days(1);
    (previous_end - length, previous_end)
}

pub async fn detailed_stats(
    pool: &PgPool,
    start: NaiveDate,
    end: NaiveDate,
    group_by: GroupBy,
    include_comparison: bool,
) -> Result<Value, AppError> {
    let bills = fetch_bills_in_range(pool, start, end).await?;
    let mut stats = aggregate_bills(&bills, start, end, group_by);

    if include_comparison {
        let (previous_start, previous_end) = preceding_period(start, end);
        let previous_bills = fetch_bills_in_range(pool, previous_start, previous_end).await?;
        let comparison = aggregate_bills(&previous_bills, previous_start, previous_end, group_by);
        if let Some(obj) = stats.as_object_mut() {
            obj.insert("comparison".to_string(), comparison);
        }
    }

    Ok(stats)
}

pub async fn detailed_stats_now(
    pool: &PgPool,
    start: Option<&str>,
    end: Option<&str>,
    range: Option<&str>,
    group_by_raw: &str,
    include_comparison: bool,
) -> Result<Value, AppError> {
    let today = Utc::now().date_naive();
    let (start_date, end_date) = parse_date_range(start, end, range, today)?;
    let group_by = GroupBy::parse(group_by_raw)?;
    detailed_stats(pool, start_date, end_date, group_by, include_comparison).await
}

async fn fetch_bills_in_range(
    pool: &PgPool,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Value>, AppError> {
    let mut filters = Map::new();
    filters.insert(
        "due_date__gte".to_string(),
        Value::String(start.to_string()),
    );
    filters.insert("due_date__lte".to_string(), Value::String(end.to_string()));
    list_rows(pool, "bills", Some(&filters), 5000, 0, "due_date", true).await
}

#[derive(Debug, Default, Clone)]
struct BucketTotals {
    total: Decimal,
    paid: Decimal,
    pending: Decimal,
    overdue: Decimal,
    count: i64,
}

/// Aggregate a bill set over [start, end]. Pure; the bills are assumed
/// pre-filtered by due date but out-of-range rows are skipped defensively
/// so the bucket map never grows past the range.
pub fn aggregate_bills(
    bills: &[Value],
    start: NaiveDate,
    end: NaiveDate,
    group_by: GroupBy,
) -> Value {
    let mut buckets: BTreeMap<NaiveDate, BucketTotals> = bucket_starts(start, end, group_by)
        .into_iter()
        .map(|bucket| (bucket, BucketTotals::default()))
        .collect();

    let mut totals = BucketTotals::default();
    let mut type_breakdown: BTreeMap<String, (Decimal, i64)> = BTreeMap::new();

    for bill in bills {
        let Some(due_date) = parse_date(&val_str(bill, "due_date")) else {
            continue;
        };
        if due_date < start || due_date > end {
            continue;
        }

        let amount = money::decimal_field(bill, "amount");
        let received = money::decimal_field(bill, "received_amount");
        let pending = money::decimal_field(bill, "pending_amount");
        let status = val_str(bill, "status");
        let overdue = if status == "overdue" {
            pending
        } else {
            Decimal::ZERO
        };

        totals.total += amount;
        totals.paid += received;
        totals.pending += pending;
        totals.overdue += overdue;
        totals.count += 1;

        let bucket = buckets
            .entry(bucket_key(due_date, group_by))
            .or_default();
        bucket.total += amount;
        bucket.paid += received;
        bucket.pending += pending;
        bucket.overdue += overdue;
        bucket.count += 1;

        let bill_type = val_str(bill, "bill_type");
        let entry = type_breakdown
            .entry(if bill_type.is_empty() {
                "other".to_string()
            } else {
                bill_type
            })
            .or_insert((Decimal::ZERO, 0));
        entry.0 += amount;
        entry.1 += 1;
    }

    let time_series = buckets
        .iter()
        .map(|(bucket_start, bucket)| {
            json!({
                "period_start": bucket_start.to_string(),
                "total_amount": money::to_json_number(bucket.total),
                "paid_amount": money::to_json_number(bucket.paid),
                "pending_amount": money::to_json_number(bucket.pending),
                "overdue_amount": money::to_json_number(bucket.overdue),
                "bill_count": bucket.count,
            })
        })
        .collect::<Vec<_>>();

    let breakdown = type_breakdown
        .iter()
        .map(|(bill_type, (amount, count))| {
            (
                bill_type.clone(),
                json!({
                    "amount": money::to_json_number(*amount),
                    "count": count,
                }),
            )
        })
        .collect::<Map<_, _>>();

    json!({
        "start": start.to_string(),
        "end": end.to_string(),
        "group_by": match group_by {
            GroupBy::Day => "day",
            GroupBy::Week => "week",
            GroupBy::Month => "month",
        },
        "total_amount": money::to_json_number(totals.total),
        "paid_amount": money::to_json_number(totals.paid),
        "pending_amount": money::to_json_number(totals.pending),
        "overdue_amount": money::to_json_number(totals.overdue),
        "bill_count": totals.count,
        "time_series": time_series,
        "type_breakdown": breakdown,
    })
}

/// The bucket a date falls into: the date itself, the Monday of its week,
/// or the first of its month.
pub fn bucket_key(date: NaiveDate, group_by: GroupBy) -> NaiveDate {
    match group_by {
        GroupBy::Day => date,
        GroupBy::Week => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        GroupBy::Month => first_of_month(date),
    }
}

/// Every bucket boundary touching [start, end], in order, with no gaps.
pub fn bucket_starts(start: NaiveDate, end: NaiveDate, group_by: GroupBy) -> Vec<NaiveDate> {
    let mut starts = Vec::new();
    let mut cursor = bucket_key(start, group_by);
    while cursor <= end {
        starts.push(cursor);
        cursor = match group_by {
            GroupBy::Day => cursor + Duration::days(1),
            GroupBy::Week => cursor + Duration::days(7),
            GroupBy::Month => {
                let zero_based = cursor.month0() + 1;
                let year = cursor.year() + (zero_based / 12) as i32;
                NaiveDate::from_ymd_opt(year, zero_based % 12 + 1, 1).unwrap_or(cursor + Duration::days(31))
            }
        };
    }
    starts
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(text: &str) -> NaiveDate {
        text.parse().expect("valid date literal")
    }

    #[test]
    fn resolves_presets_relative_to_today() {
        let today = date("2024-05-15"); // a Wednesday

        assert_eq!(
            parse_date_range(None, None, Some("today"), today).unwrap(),
            (today, today)
        );
        assert_eq!(
            parse_date_range(None, None, Some("week"), today).unwrap(),
            (date("2024-05-13"), today)
        );
        assert_eq!(
            parse_date_range(None, None, Some("month"), today).unwrap(),
            (date("2024-05-01"), today)
        );
        assert_eq!(
            parse_date_range(None, None, Some("quarter"), today).unwrap(),
            (date("2024-04-01"), today)
        );
        assert_eq!(
            parse_date_range(None, None, Some("year"), today).unwrap(),
            (date("2024-01-01"), today)
        );
    }

    #[test]
    fn rejects_missing_or_inverted_ranges() {
        let today = date("2024-05-15");
        assert!(parse_date_range(None, None, None, today).is_err());
        assert!(parse_date_range(Some("2024-01-10"), None, None, today).is_err());
        assert!(
            parse_date_range(Some("2024-02-01"), Some("2024-01-01"), None, today).is_err()
        );
        assert!(parse_date_range(None, None, Some("fortnight"), today).is_err());
        assert!(
            parse_date_range(Some("2024-01-01"), Some("2024-01-31"), None, today).is_ok()
        );
    }

    #[test]
    fn explicit_dates_win_over_presets() {
        let today = date("2024-05-15");
        let (start, end) =
            parse_date_range(Some("2024-03-01"), Some("2024-03-31"), Some("year"), today)
                .unwrap();
        assert_eq!((start, end), (date("2024-03-01"), date("2024-03-31")));
    }

    #[test]
    fn preceding_period_has_equal_length() {
        let (previous_start, previous_end) =
            preceding_period(date("2024-03-01"), date("2024-03-31"));
        assert_eq!(previous_end, date("2024-02-29"));
        assert_eq!(previous_start, date("2024-01-30"));
        assert_eq!(
            previous_end - previous_start,
            date("2024-03-31") - date("2024-03-01")
        );
    }

    #[test]
    fn empty_range_still_yields_every_bucket() {
        let stats = aggregate_bills(&[], date("2024-01-01"), date("2024-01-05"), GroupBy::Day);
        let series = stats["time_series"].as_array().unwrap();
        assert_eq!(series.len(), 5);
        assert!(series
            .iter()
            .all(|bucket| bucket["total_amount"] == json!(0.0) && bucket["bill_count"] == json!(0)));
    }

    #[test]
    fn week_and_month_buckets_are_contiguous() {
        // 2024-01-01 is a Monday.
        let weeks = bucket_starts(date("2024-01-03"), date("2024-01-20"), GroupBy::Week);
        assert_eq!(
            weeks,
            vec![date("2024-01-01"), date("2024-01-08"), date("2024-01-15")]
        );

        let months = bucket_starts(date("2024-11-15"), date("2025-01-02"), GroupBy::Month);
        assert_eq!(
            months,
            vec![date("2024-11-01"), date("2024-12-01"), date("2025-01-01")]
        );
    }

    #[test]
    fn aggregates_totals_buckets_and_type_breakdown() {
        let bills = vec![
            json!({"due_date": "2024-01-01", "amount": 3000.0, "received_amount": 3000.0,
                   "pending_amount": 0.0, "status": "paid", "bill_type": "rent"}),
            json!({"due_date": "2024-01-01", "amount": 6000.0, "received_amount": 0.0,
                   "pending_amount": 6000.0, "status": "pending", "bill_type": "deposit"}),
            json!({"due_date": "2024-01-02", "amount": 500.0, "received_amount": 100.0,
                   "pending_amount": 400.0, "status": "overdue", "bill_type": "rent"}),
        ];

        let stats = aggregate_bills(&bills, date("2024-01-01"), date("2024-01-03"), GroupBy::Day);
        assert_eq!(stats["total_amount"], json!(9500.0));
        assert_eq!(stats["paid_amount"], json!(3100.0));
        assert_eq!(stats["pending_amount"], json!(6400.0));
        assert_eq!(stats["overdue_amount"], json!(400.0));
        assert_eq!(stats["bill_count"], json!(3));

        let series = stats["time_series"].as_array().unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0]["total_amount"], json!(9000.0));
        assert_eq!(series[1]["overdue_amount"], json!(400.0));
        assert_eq!(series[2]["bill_count"], json!(0));

        assert_eq!(stats["type_breakdown"]["rent"]["amount"], json!(3500.0));
        assert_eq!(stats["type_breakdown"]["rent"]["count"], json!(2));
        assert_eq!(stats["type_breakdown"]["deposit"]["count"], json!(1));
    }

    #[test]
    fn out_of_range_bills_are_ignored() {
        let bills = vec![json!({
            "due_date": "2024-02-10", "amount": 1000.0, "received_amount": 0.0,
            "pending_amount": 1000.0, "status": "pending", "bill_type": "rent"
        })];
        let stats = aggregate_bills(&bills, date("2024-01-01"), date("2024-01-31"), GroupBy::Day);
        assert_eq!(stats["bill_count"], json!(0));
        assert_eq!(stats["time_series"].as_array().unwrap().len(), 31);
    }
}
