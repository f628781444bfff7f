//! Asset reference validation.

use url::Url;

use super::AssetError;

/// Maximum accepted reference length in bytes.
pub const MAX_URL_LENGTH: usize = 2000;

/// Validates an asset reference and returns the parsed URL.
///
/// # Validation rules:
/// - Must not be empty
/// - Must not exceed [`MAX_URL_LENGTH`] (2000 chars)
/// - Must be parseable by the `url` crate
/// - Must use http or https scheme (no ftp, file, data, etc.)
/// - Must have a host (domain or IP)
///
/// # Errors
///
/// Returns [`AssetError::Validation`] naming the failed rule.
pub fn validate_url(raw: &str) -> Result<Url, AssetError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AssetError::validation(raw, "empty reference"));
    }

    // Length first; avoids parsing pathological input
    if trimmed.len() > MAX_URL_LENGTH {
        return Err(AssetError::validation(
            truncate_for_display(trimmed),
            format!("exceeds {MAX_URL_LENGTH} characters"),
        ));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| AssetError::validation(trimmed, format!("malformed URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AssetError::validation(
                trimmed,
                format!("unsupported scheme '{scheme}'"),
            ));
        }
    }

    if parsed.host().is_none() {
        return Err(AssetError::validation(trimmed, "missing host"));
    }

    Ok(parsed)
}

fn truncate_for_display(raw: &str) -> String {
    let mut end = 80.min(raw.len());
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
