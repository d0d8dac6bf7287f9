//! Response helpers shared by the service apps and the gateway proxy.

use bytes::Bytes;
use http::{header, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

pub const APPLICATION_JSON: &str = "application/json";

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

/// Serializes `data` as a JSON response with the given status.
pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
    match serde_json::to_vec(data) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, APPLICATION_JSON)
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("Failed to build JSON response: {e}");
                internal_server_error()
            }),
        Err(e) => {
            log::error!("Failed to serialize JSON response: {e}");
            internal_server_error()
        }
    }
}

/// `{"detail": message}` with the given status.
pub fn error(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    json(status, &ErrorBody { detail: message })
}

fn internal_server_error() -> Response<Vec<u8>> {
    let mut resp = Response::new(b"Internal Server Error".to_vec());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}

/// Writes a complete JSON response on a proxy session, bypassing the upstream.
pub async fn send_proxy_json<T: Serialize>(
    session: &mut Session,
    status: StatusCode,
    data: &T,
) -> Result<()> {
    let body = serde_json::to_vec(data).unwrap_or_else(|e| {
        log::error!("Failed to serialize proxy response: {e}");
        b"{}".to_vec()
    });

    let mut resp = ResponseHeader::build(status, Some(2))?;
    resp.insert_header(header::CONTENT_TYPE, APPLICATION_JSON)?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;

    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::from(body)), true)
        .await?;

    Ok(())
}

/// Writes a `{"detail": message}` error on a proxy session.
pub async fn send_proxy_error(
    session: &mut Session,
    status: StatusCode,
    message: &str,
) -> Result<()> {
    send_proxy_json(session, status, &ErrorBody { detail: message }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response() {
        let data = serde_json::json!({"status": "UP"});
        let response = json(StatusCode::OK, &data);
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            APPLICATION_JSON,
            response.headers()[header::CONTENT_TYPE].to_str().unwrap()
        );
        assert_eq!(br#"{"status":"UP"}"#, response.body().as_slice());
    }

    #[test]
    fn test_error_response() {
        let response = error(StatusCode::NOT_FOUND, "Project not found");
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        assert_eq!(
            br#"{"detail":"Project not found"}"#,
            response.body().as_slice()
        );
    }
}
