//! Pure field normalization shared by every adapter.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use ijf_core::JobType;
use tracing::warn;

/// Upper bound for plausible salary figures. Larger values are treated as
/// source errors and dropped.
const SALARY_CAP: f64 = 10_000_000.0;

/// Epoch timestamps arrive in seconds or milliseconds depending on the
/// source; anything above 10^12 is taken as milliseconds.
pub fn timestamp_to_datetime(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let seconds = if value > 1e12 { value / 1000.0 } else { value };
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

/// Lenient ISO-8601 parsing: RFC 3339 first, then a naive datetime or
/// bare date assumed to be UTC. Unparseable input degrades to `None`.
pub fn parse_iso_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    warn!(value = trimmed, "could not parse date");
    None
}

/// Map a free-form employment label onto the closed `JobType` set.
pub fn map_job_type(label: &str) -> JobType {
    let lower = label.to_ascii_lowercase();
    if lower.is_empty() {
        return JobType::FullTime;
    }
    if lower.contains("part") {
        JobType::PartTime
    } else if lower.contains("contract") || lower.contains("consult") {
        JobType::Contract
    } else if lower.contains("freelance") {
        JobType::Freelance
    } else if lower.contains("intern") {
        JobType::Internship
    } else {
        JobType::FullTime
    }
}

/// Reject negative and implausibly large salary figures.
pub fn sanitize_salary(value: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value > SALARY_CAP {
        warn!(value, "salary value too large, dropping");
        return None;
    }
    Some(value)
}

/// ISO-4217-ish: first three characters, uppercased.
pub fn normalize_currency(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(3).collect::<String>().to_ascii_uppercase())
}

pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn timestamps_handle_seconds_and_milliseconds() {
        let from_seconds = timestamp_to_datetime(1_700_000_000.0).expect("seconds");
        let from_millis = timestamp_to_datetime(1_700_000_000_000.0).expect("millis");
        assert_eq!(from_seconds, from_millis);
        assert_eq!(from_seconds.year(), 2023);

        assert!(timestamp_to_datetime(0.0).is_none());
        assert!(timestamp_to_datetime(-5.0).is_none());
    }

    #[test]
    fn iso_dates_parse_with_and_without_offset() {
        let rfc = parse_iso_date("2026-01-15T09:30:00Z").expect("rfc3339");
        assert_eq!(rfc.year(), 2026);
        let naive = parse_iso_date("2026-01-15T09:30:00").expect("naive");
        assert_eq!(rfc, naive);
        let date_only = parse_iso_date("2026-01-15").expect("date");
        assert_eq!(date_only.year(), 2026);
        assert!(parse_iso_date("not a date").is_none());
        assert!(parse_iso_date("").is_none());
    }

    #[test]
    fn job_type_mapping_is_keyword_based() {
        assert_eq!(map_job_type("Part-time"), JobType::PartTime);
        assert_eq!(map_job_type("Contractor"), JobType::Contract);
        assert_eq!(map_job_type("Consulting role"), JobType::Contract);
        assert_eq!(map_job_type("Freelance"), JobType::Freelance);
        assert_eq!(map_job_type("Internship"), JobType::Internship);
        assert_eq!(map_job_type("Permanent"), JobType::FullTime);
        assert_eq!(map_job_type(""), JobType::FullTime);
    }

    #[test]
    fn salary_sanitizing_caps_and_rejects() {
        assert_eq!(sanitize_salary(90_000.0), Some(90_000.0));
        assert_eq!(sanitize_salary(10_000_001.0), None);
        assert_eq!(sanitize_salary(-1.0), None);
        assert_eq!(sanitize_salary(f64::NAN), None);
    }

    #[test]
    fn currency_is_three_letter_upper() {
        assert_eq!(normalize_currency("usd"), Some("USD".to_string()));
        assert_eq!(normalize_currency("USDollars"), Some("USD".to_string()));
        assert_eq!(normalize_currency("  "), None);
    }
}
