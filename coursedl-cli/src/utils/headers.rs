use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::AppError;

/// Parses `-H 'Name: Value'` flags into the extra headers sent with every
/// request. A malformed flag is an error rather than silently dropped, and
/// `Cookie` is refused since the session owns it (`--cookie`).
pub fn parse_headers(header_strings: &[String]) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();

    for raw in header_strings {
        let (name, value) = raw.split_once(':').ok_or_else(|| {
            AppError::InvalidInput(format!("header '{raw}' is not in 'Name: Value' form"))
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| AppError::InvalidInput(format!("invalid header name in '{raw}'")))?;
        if name == COOKIE {
            return Err(AppError::InvalidInput(
                "pass session cookies with --cookie instead of -H".to_string(),
            ));
        }
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| AppError::InvalidInput(format!("invalid value for header '{name}'")))?;

        debug!(header = %name, "Extra request header");
        headers.insert(name, value);
    }

    Ok(headers)
}
