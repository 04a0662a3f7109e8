// ABOUTME: Recursive sanitization of structured request parameters
// ABOUTME: Strips script tags, inline event handlers and javascript: prefixes from every string value

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>").expect("valid script regex")
});

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/?\s*script\b[^>]*>").expect("valid script tag regex"));

static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bon[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]*)"#)
        .expect("valid event handler regex")
});

static JAVASCRIPT_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").expect("valid scheme regex"));

pub fn sanitize_str(input: &str) -> String {
    let mut out = input.to_string();
    // Repeat until stable so nested fragments like `<scr<script>ipt>` cannot reassemble
    loop {
        let next = SCRIPT_BLOCK.replace_all(&out, "");
        let next = SCRIPT_TAG.replace_all(&next, "");
        let next = EVENT_HANDLER.replace_all(&next, "");
        let next = JAVASCRIPT_SCHEME.replace_all(&next, "").into_owned();
        if next == out {
            return out;
        }
        out = next;
    }
}

/// Sanitize every string value at any depth. Object keys and non-string scalars are kept.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}
