use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use http::{Method, StatusCode, Uri};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorSource, ErrorType, ErrorType::HTTPStatus, Result};
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};
use serde::Serialize;

use crate::config::TimeoutPolicy;
use crate::discovery::ServiceEndpoint;
use crate::utils::response::{send_proxy_error, send_proxy_json};

use super::{GatewayRouter, ProxyRequest, RouteError};

pub const HEALTH_PATH: &str = "/health";

/// Per-request state. Dropped with the request, endpoint included.
pub struct GatewayContext {
    pub request: Option<ProxyRequest>,
    pub endpoint: Option<ServiceEndpoint>,
    pub peer_addr: Option<SocketAddr>,
    pub request_start: Instant,
}

impl Default for GatewayContext {
    fn default() -> Self {
        Self {
            request: None,
            endpoint: None,
            peer_addr: None,
            request_start: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

/// Gateway proxy service.
///
/// Forwards `/{service}/{path...}` to the instance the registry currently
/// knows for `service`, relaying the downstream response as-is.
pub struct GatewayService {
    router: GatewayRouter,
    timeouts: TimeoutPolicy,
}

impl GatewayService {
    pub fn new(router: GatewayRouter, timeouts: TimeoutPolicy) -> Self {
        Self { router, timeouts }
    }

    async fn plan(
        &self,
        method: &Method,
        uri: &Uri,
        ctx: &mut GatewayContext,
    ) -> std::result::Result<(), RouteError> {
        let request = ProxyRequest::from_parts(method, uri)?;
        let endpoint = self.router.route(&request).await?;

        let peer_addr = endpoint.socket_addr().await.map_err(|e| {
            log::warn!("Cannot resolve host of {endpoint} for '{}': {e}", request.service);
            RouteError::Unavailable(request.service.clone())
        })?;

        ctx.peer_addr = Some(peer_addr);
        ctx.endpoint = Some(endpoint);
        ctx.request = Some(request);
        Ok(())
    }
}

pub fn route_error_status(e: &RouteError) -> StatusCode {
    match e {
        RouteError::UnknownService(_) => StatusCode::NOT_FOUND,
        RouteError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Status answered for a request that failed while proxying.
///
/// Anything the upstream side caused counts as the service being unavailable.
/// `0` means the downstream is gone and nothing should be written.
pub fn proxy_failure_status(e: &Error) -> u16 {
    if let HTTPStatus(code) = e.etype() {
        return *code;
    }
    match e.esource() {
        ErrorSource::Upstream => StatusCode::SERVICE_UNAVAILABLE.as_u16(),
        ErrorSource::Downstream => match e.etype() {
            ErrorType::WriteError | ErrorType::ReadError | ErrorType::ConnectionClosed => 0,
            _ => StatusCode::BAD_REQUEST.as_u16(),
        },
        ErrorSource::Internal | ErrorSource::Unset => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
    }
}

#[async_trait]
impl ProxyHttp for GatewayService {
    type CTX = GatewayContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Answers health checks and rejects requests that cannot be routed.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let method = session.req_header().method.clone();
        let uri = session.req_header().uri.clone();

        if method == Method::GET && uri.path() == HEALTH_PATH {
            send_proxy_json(session, StatusCode::OK, &Health { status: "UP" }).await?;
            return Ok(true);
        }

        if let Err(e) = self.plan(&method, &uri, ctx).await {
            log::info!("{method} {uri}: {e}");
            send_proxy_error(session, route_error_status(&e), &e.to_string()).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let addr = ctx.peer_addr.ok_or_else(|| {
            Error::explain(
                HTTPStatus(StatusCode::SERVICE_UNAVAILABLE.as_u16()),
                "No resolved endpoint for request",
            )
        })?;

        let mut peer = HttpPeer::new(addr, false, String::new());
        peer.options.connection_timeout = self.timeouts.connect();
        peer.options.read_timeout = self.timeouts.read();
        peer.options.write_timeout = self.timeouts.send();
        Ok(Box::new(peer))
    }

    /// Strips the service prefix. Method and headers go out unchanged.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(request) = ctx.request.as_ref() {
            let uri = request.upstream_uri().map_err(|e| {
                Error::because(
                    HTTPStatus(StatusCode::BAD_REQUEST.as_u16()),
                    format!("Invalid upstream path {}", request.path),
                    e,
                )
            })?;
            upstream_request.set_uri(uri);
        }
        Ok(())
    }

    /// A resolved instance that cannot be reached is reported like one that
    /// could not be resolved. No retry.
    fn fail_to_connect(
        &self,
        _session: &mut Session,
        peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        let service = ctx
            .request
            .as_ref()
            .map_or("unknown", |r| r.service.as_str());
        log::warn!(
            "Failed to connect to {} for '{service}': {e}",
            peer._address
        );
        Error::because(
            HTTPStatus(StatusCode::SERVICE_UNAVAILABLE.as_u16()),
            format!("Service unavailable: {service}"),
            e,
        )
    }

    /// Reports every failure past routing with the same JSON body the router
    /// uses, unless the downstream response has already started.
    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16
    where
        Self::CTX: Send,
    {
        let code = proxy_failure_status(e);
        if code == 0 || session.response_written().is_some() {
            return code;
        }

        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match ctx.request.as_ref() {
            Some(request) if status == StatusCode::SERVICE_UNAVAILABLE => {
                RouteError::Unavailable(request.service.clone()).to_string()
            }
            _ => status
                .canonical_reason()
                .unwrap_or("Proxy failure")
                .to_string(),
        };
        if let Err(write_err) = send_proxy_error(session, status, &detail).await {
            log::warn!("Failed to send error response: {write_err}");
        }
        code
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let req_header = session.req_header();
        let upstream = ctx
            .endpoint
            .as_ref()
            .map_or_else(|| "-".to_string(), |endpoint| endpoint.to_string());

        match e {
            Some(e) => log::error!(
                "{} {} -> {upstream} {status} in {:?}: {e}",
                req_header.method,
                req_header.uri,
                ctx.request_start.elapsed()
            ),
            None => log::info!(
                "{} {} -> {upstream} {status} in {:?}",
                req_header.method,
                req_header.uri,
                ctx.request_start.elapsed()
            ),
        }
    }
}
