use reqwest::header::HeaderMap;
use url::Url;

use super::ACCESS_KEY_PARAM;

pub const DEFAULT_BODY_LOG_LIMIT: usize = 10_000;

/// Render a request as a shell `curl` command that can be pasted into a
/// terminal or imported into Postman.
pub fn curl_command(method: &str, url: &str, headers: &HeaderMap, body: Option<&[u8]>) -> String {
    let mut parts = vec![
        "curl".to_string(),
        "-X".to_string(),
        method.to_string(),
        format!("\"{}\"", escape_double(url)),
    ];

    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        parts.push("-H".to_string());
        parts.push(format!("\"{}: {}\"", name.as_str(), escape_double(&value)));
    }

    if let Some(body) = body.filter(|b| !b.is_empty()) {
        let text = match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(v) => serde_json::to_string_pretty(&v)
                .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()),
            Err(_) => String::from_utf8_lossy(body).into_owned(),
        };
        parts.push("-d".to_string());
        parts.push(format!("'{}'", text.replace('\'', r"'\''")));
    }

    parts.join(" ")
}

/// URL with the access key masked, for log lines other than the opt-in curl command.
pub fn redact_access_key(url: &Url) -> String {
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .map(|(k, v)| if k == ACCESS_KEY_PARAM { (k, "***".to_string()) } else { (k, v) })
        .collect();
    if !pairs.is_empty() {
        masked.query_pairs_mut().clear().extend_pairs(pairs);
    }
    masked.to_string()
}

fn escape_double(s: &str) -> String {
    s.replace('\\', r"\\").replace('"', "\\\"")
}

/// Pretty-print a response body for logging, truncated to `max_len` bytes.
pub fn format_response_body(body: &[u8], max_len: usize) -> String {
    let max_len = if max_len == 0 {
        DEFAULT_BODY_LOG_LIMIT
    } else {
        max_len
    };
    let text = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(v) => serde_json::to_string_pretty(&v)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    };
    if text.len() <= max_len {
        return text;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n... (response body truncated, actual length: {} bytes)",
        &text[..cut],
        body.len()
    )
}
