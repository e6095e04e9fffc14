//! Normalization of raw publishing API responses.
//!
//! The API's payloads vary in shape and casing between endpoints and
//! platforms (`id` vs `postId` vs `ID`, numeric vs string ids, errors as a
//! string, an object or an array). Nothing outside this module looks at the
//! raw JSON.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{PublishFailure, PublishReceipt};

const ID_KEYS: &[&str] = &["id", "postId", "post_id", "ID", "externalId"];
const MESSAGE_KEYS: &[&str] = &["message", "error", "errorMessage", "detail"];
const CODE_KEYS: &[&str] = &["code", "errorCode", "error_code"];
const PLATFORM_KEYS: &[&str] = &["platform", "target", "network"];
const PUBLISHED_AT_KEYS: &[&str] = &["publishedAt", "published_at", "created", "createdAt"];

/// Map an HTTP status and raw body into a receipt or a failure for `target`.
pub fn normalize_response(
    http_status: u16,
    body: &str,
    target: &str,
) -> Result<PublishReceipt, PublishFailure> {
    let success = (200..300).contains(&http_status);

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if success => {
            return Err(PublishFailure::new(
                Some(http_status),
                format!("unparseable response body: {}", truncate(body, 200)),
                Some("invalid_response".into()),
            ));
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                "empty response body".to_string()
            } else {
                truncate(body, 500)
            };
            return Err(PublishFailure::new(Some(http_status), message, None));
        }
    };

    if !success || reports_error(&value) {
        return Err(extract_failure(&value, http_status, target));
    }

    // Per-platform entries take precedence over top-level fields
    let entry = platform_entry(&value, target);
    if let Some(entry) = entry {
        if reports_error(entry) {
            return Err(extract_failure(entry, http_status, target));
        }
    }

    let external_id = entry
        .and_then(|e| string_field(e, ID_KEYS))
        .or_else(|| string_field(&value, ID_KEYS))
        .ok_or_else(|| {
            PublishFailure::new(
                Some(http_status),
                "response did not include a post id",
                Some("invalid_response".into()),
            )
        })?;

    let published_at = entry
        .and_then(|e| timestamp_field(e, PUBLISHED_AT_KEYS))
        .or_else(|| timestamp_field(&value, PUBLISHED_AT_KEYS))
        .unwrap_or_else(Utc::now);

    Ok(PublishReceipt {
        external_id,
        published_at,
    })
}

/// Whether a 2xx body still reports an error.
fn reports_error(value: &Value) -> bool {
    let status_error = value
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("error") || s.eq_ignore_ascii_case("failed"));
    let error_flag = value.get("error").is_some_and(|e| match e {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    });
    status_error || error_flag
}

fn extract_failure(value: &Value, http_status: u16, target: &str) -> PublishFailure {
    // Prefer the error entry for this target if the body lists several
    let errors = array_field(value, &["errors", "postErrors"]);
    let scoped = errors.and_then(|errs| {
        errs.iter()
            .find(|e| {
                string_field(e, PLATFORM_KEYS).is_some_and(|p| p.eq_ignore_ascii_case(target))
            })
            .or_else(|| errs.first())
    });
    let source = scoped.unwrap_or(value);

    let message = message_of(source)
        .or_else(|| message_of(value))
        .unwrap_or_else(|| truncate(&value.to_string(), 500));
    let code = string_field(source, CODE_KEYS).or_else(|| string_field(value, CODE_KEYS));

    PublishFailure::new(Some(http_status), message, code)
}

fn message_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => MESSAGE_KEYS.iter().find_map(|key| match value.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(nested @ Value::Object(_)) => message_of(nested),
            _ => None,
        }),
        _ => None,
    }
}

fn platform_entry<'a>(value: &'a Value, target: &str) -> Option<&'a Value> {
    let entries = array_field(value, &["postIds", "post_ids", "posts", "results"])?;
    entries
        .iter()
        .find(|e| string_field(e, PLATFORM_KEYS).is_some_and(|p| p.eq_ignore_ascii_case(target)))
        .or_else(|| (entries.len() == 1).then(|| &entries[0]))
}

fn array_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_array))
}

/// First present key as a string; numbers are stringified.
fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
