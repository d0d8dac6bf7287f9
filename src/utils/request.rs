use pingora::protocols::http::ServerSession;
use pingora_error::Result;
use url::form_urlencoded;

/// Extracts the decoded value of a query parameter from a raw query string.
///
/// Returns the first occurrence; a bare key yields an empty value.
pub fn get_query_value(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
}

/// Parses a boolean query flag, accepting the usual spellings.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Reads the whole request body of a served session.
pub async fn read_request_body(http_session: &mut ServerSession) -> Result<Vec<u8>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session.read_request_body().await? {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}
