//! User-Agent string for outbound asset requests.

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/imgsync";

/// Default User-Agent for asset requests (identifies the tool).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("imgsync/{version} (image-localizer; +{PROJECT_UA_URL})")
}
