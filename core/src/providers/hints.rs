//! Server-supplied retry hints.
//!
//! Providers communicate back-off windows two ways: the standard
//! `Retry-After` header (delta seconds or HTTP date) and, for Gemini, a
//! `RetryInfo` detail embedded in the error body. Hints are clamped so a
//! misbehaving server cannot park a worker for minutes.

use httpdate::parse_http_date;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::{Duration, SystemTime};

/// Longest delay we will honor from a server hint.
pub const MAX_HINT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintSource {
    RetryAfterHeader,
    GeminiRetryInfo,
}

impl HintSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HintSource::RetryAfterHeader => "retry-after",
            HintSource::GeminiRetryInfo => "gemini-retry-info",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryHint {
    pub delay: Duration,
    pub source: HintSource,
}

impl RetryHint {
    pub fn clamped_delay(&self) -> Duration {
        self.delay.min(MAX_HINT_DELAY)
    }
}

/// Extract a hint from response headers, if one is present and parseable.
pub fn hint_from_headers(headers: &HeaderMap) -> Option<RetryHint> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    parse_retry_after(raw, SystemTime::now()).map(|delay| RetryHint {
        delay,
        source: HintSource::RetryAfterHeader,
    })
}

/// Parse a `Retry-After` value: either delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str, now: SystemTime) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(when) = parse_http_date(trimmed) {
        return match when.duration_since(now) {
            Ok(delta) => Some(delta),
            // A date in the past still means "retry now".
            Err(_) => Some(Duration::from_secs(0)),
        };
    }

    None
}

#[derive(Debug, Default)]
pub struct GeminiErrorHints {
    pub retry_hint: Option<RetryHint>,
    pub quota_exhausted: bool,
}

/// Dig RetryInfo / QuotaFailure details out of a Gemini error body.
pub fn gemini_hints_from_body(body: &str) -> GeminiErrorHints {
    let mut hints = GeminiErrorHints::default();
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return hints;
    };
    let Some(details) = value
        .get("error")
        .and_then(|error| error.get("details"))
        .and_then(Value::as_array)
    else {
        return hints;
    };

    for detail in details {
        let type_url = detail.get("@type").and_then(Value::as_str).unwrap_or("");
        if type_url.ends_with("RetryInfo") {
            if hints.retry_hint.is_none() {
                if let Some(delay) = detail.get("retryDelay").and_then(parse_proto_duration) {
                    hints.retry_hint = Some(RetryHint {
                        delay,
                        source: HintSource::GeminiRetryInfo,
                    });
                }
            }
        } else if type_url.ends_with("QuotaFailure") {
            hints.quota_exhausted = true;
        }
    }

    hints
}

// protobuf Duration arrives either as "3s" / "1.5s" or as an object with
// seconds / nanos fields (sometimes stringified).
fn parse_proto_duration(value: &Value) -> Option<Duration> {
    if let Some(text) = value.as_str() {
        let stripped = text.trim().strip_suffix('s')?;
        let seconds = stripped.parse::<f64>().ok()?;
        if !seconds.is_finite() || seconds.is_sign_negative() {
            return None;
        }
        return Some(Duration::from_secs_f64(seconds));
    }

    let object = value.as_object()?;
    let seconds = object.get("seconds").and_then(int_field).unwrap_or(0);
    let nanos = object.get("nanos").and_then(int_field).unwrap_or(0);
    if seconds < 0 || nanos < 0 {
        return None;
    }
    let secs: u64 = seconds.try_into().ok()?;
    let nanos: u32 = nanos.try_into().ok()?;
    Some(Duration::new(secs, nanos))
}

fn int_field(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn delta_seconds_header() {
        let parsed = parse_retry_after("120", SystemTime::now()).unwrap();
        assert_eq!(parsed, Duration::from_secs(120));
    }

    #[test]
    fn http_date_header() {
        let now = SystemTime::now();
        let later = now + Duration::from_secs(30);
        let header = httpdate::fmt_http_date(later);
        let parsed = parse_retry_after(&header, now).unwrap();
        assert_eq!(parsed.as_secs(), 30);
    }

    #[test]
    fn past_http_date_means_retry_now() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(30);
        let header = httpdate::fmt_http_date(earlier);
        assert_eq!(
            parse_retry_after(&header, now),
            Some(Duration::from_secs(0))
        );
    }

    #[test]
    fn garbage_header_is_ignored() {
        assert!(parse_retry_after("soon", SystemTime::now()).is_none());
        assert!(parse_retry_after("", SystemTime::now()).is_none());
    }

    #[test]
    fn header_map_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let hint = hint_from_headers(&headers).unwrap();
        assert_eq!(hint.delay, Duration::from_secs(7));
        assert_eq!(hint.source, HintSource::RetryAfterHeader);
    }

    #[test]
    fn hint_delay_is_clamped() {
        let hint = RetryHint {
            delay: Duration::from_secs(3600),
            source: HintSource::RetryAfterHeader,
        };
        assert_eq!(hint.clamped_delay(), MAX_HINT_DELAY);
    }

    #[test]
    fn gemini_retry_info_string_form() {
        let body = r#"{"error":{"details":[
            {"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"2.5s"}
        ]}}"#;
        let hints = gemini_hints_from_body(body);
        let hint = hints.retry_hint.unwrap();
        assert_eq!(hint.delay, Duration::from_secs_f64(2.5));
        assert_eq!(hint.source, HintSource::GeminiRetryInfo);
    }

    #[test]
    fn gemini_retry_info_object_form() {
        let body = r#"{"error":{"details":[
            {"@type":"type.googleapis.com/google.rpc.RetryInfo",
             "retryDelay":{"seconds":"4","nanos":500000000}}
        ]}}"#;
        let hint = gemini_hints_from_body(body).retry_hint.unwrap();
        assert_eq!(hint.delay, Duration::new(4, 500_000_000));
    }

    #[test]
    fn gemini_quota_failure_is_flagged() {
        let body = r#"{"error":{"details":[
            {"@type":"type.googleapis.com/google.rpc.QuotaFailure","violations":[{}]}
        ]}}"#;
        let hints = gemini_hints_from_body(body);
        assert!(hints.quota_exhausted);
        assert!(hints.retry_hint.is_none());
    }

    #[test]
    fn non_json_body_yields_nothing() {
        let hints = gemini_hints_from_body("<html>502</html>");
        assert!(hints.retry_hint.is_none());
        assert!(!hints.quota_exhausted);
    }
}
