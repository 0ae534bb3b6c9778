//! Scrubs secrets, signed-URL parameters and binary blobs from log payloads.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Arrays at least this long made only of byte values are treated as binary.
const MIN_BINARY_ARRAY_LEN: usize = 16;

const SIGNED_URL_PARAMS: &[&str] = &[
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "signature",
    "x-goog-signature",
    "x-goog-credential",
    "sig",
    "token",
    "awsaccesskeyid",
    "policy",
];

/// `token`, `authToken`, `api_key`, `Authorization`, `x-api-key`, ...
pub fn is_secret_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    normalized == "authorization"
        || normalized.ends_with("token")
        || normalized.ends_with("apikey")
        || normalized.ends_with("secret")
        || normalized.ends_with("password")
}

/// Marker standing in for a binary payload.
pub fn binary(bytes: &[u8]) -> Value {
    Value::String(binary_marker(bytes.len()))
}

fn binary_marker(len: usize) -> String {
    format!("[BINARY_REDACTED length={}]", len)
}

/// Redact signed-URL query parameters in place, leaving the rest of the URL
/// byte-for-byte intact. Returns `None` when `value` is not an http(s) URL
/// with a query string.
pub fn redact_url(value: &str) -> Option<String> {
    let parsed = url::Url::parse(value).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let query_start = value.find('?')?;
    let (head, rest) = value.split_at(query_start + 1);
    let (query, fragment) = match rest.find('#') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if SIGNED_URL_PARAMS.contains(&name.to_ascii_lowercase().as_str()) => {
                format!("{}={}", name, REDACTED)
            }
            _ => pair.to_string(),
        })
        .collect();

    Some(format!("{}{}{}", head, redacted.join("&"), fragment))
}

fn looks_binary(items: &[Value]) -> bool {
    items.len() >= MIN_BINARY_ARRAY_LEN
        && items
            .iter()
            .all(|v| v.as_u64().is_some_and(|n| n <= u8::MAX as u64))
}

/// Recursively redact a JSON payload.
pub fn redact_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_secret_key(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact_value(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) if looks_binary(&items) => Value::String(binary_marker(items.len())),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        Value::String(s) => match redact_url(&s) {
            Some(redacted) => Value::String(redacted),
            None => Value::String(s),
        },
        other => other,
    }
}
