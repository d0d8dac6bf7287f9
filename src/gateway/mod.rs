//! The gateway's discovery-based router.
//!
//! A request for `/{service}/{path...}` is checked against the configured
//! service names first and resolved through the registry second. Nothing is
//! kept between requests: two identical requests run two independent
//! resolutions.

pub mod proxy;

use std::collections::BTreeMap;

use http::{Method, Uri};
use thiserror::Error;

use crate::discovery::{RegistryClient, ServiceEndpoint};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The logical name is not served by this gateway.
    #[error("Service not found: {0}")]
    UnknownService(String),
    /// The name is known but no live instance could be resolved or reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// The routing-relevant part of an inbound request.
///
/// Headers and body are not copied here; the proxy relays them untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    pub service: String,
    /// Downstream path, always starting with `/`, query string included.
    pub path: String,
}

impl ProxyRequest {
    /// Splits `/{service}/{rest}?{query}` into its parts.
    ///
    /// `/{service}` without a suffix targets the downstream root.
    pub fn from_parts(method: &Method, uri: &Uri) -> Result<Self, RouteError> {
        let trimmed = uri.path().trim_start_matches('/');
        let (service, rest) = match trimmed.split_once('/') {
            Some((service, rest)) => (service, rest),
            None => (trimmed, ""),
        };
        if service.is_empty() {
            return Err(RouteError::UnknownService(String::new()));
        }

        let path = match uri.query() {
            Some(query) => format!("/{rest}?{query}"),
            None => format!("/{rest}"),
        };

        Ok(Self {
            method: method.clone(),
            service: service.to_string(),
            path,
        })
    }

    pub fn upstream_uri(&self) -> Result<Uri, http::uri::InvalidUri> {
        self.path.parse()
    }
}

pub struct GatewayRouter {
    /// Logical name to registry name.
    services: BTreeMap<String, String>,
    registry: RegistryClient,
}

impl GatewayRouter {
    pub fn new(services: BTreeMap<String, String>, registry: RegistryClient) -> Self {
        Self { services, registry }
    }

    /// Allow-list check. Never touches the registry.
    pub fn registry_name(&self, request: &ProxyRequest) -> Result<&str, RouteError> {
        self.services
            .get(&request.service)
            .map(String::as_str)
            .ok_or_else(|| RouteError::UnknownService(request.service.clone()))
    }

    /// Resolves the endpoint the request should be forwarded to.
    pub async fn route(&self, request: &ProxyRequest) -> Result<ServiceEndpoint, RouteError> {
        let name = self.registry_name(request)?;
        self.registry
            .resolve(name)
            .await
            .ok_or_else(|| RouteError::Unavailable(request.service.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::{client, instance, CountingRegistry};

    fn services() -> BTreeMap<String, String> {
        [
            ("tasks", "task-service"),
            ("projects", "project-service"),
            ("communication", "communication-service"),
            ("report", "report-service"),
            ("schedule", "schedule-service"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn request(method: Method, uri: &str) -> ProxyRequest {
        ProxyRequest::from_parts(&method, &uri.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let req = request(Method::DELETE, "/projects/projects/5?withTasks=true");
        assert_eq!(Method::DELETE, req.method);
        assert_eq!("projects", req.service);
        assert_eq!("/projects/5?withTasks=true", req.path);
        assert_eq!("/projects/5", req.upstream_uri().unwrap().path());

        let req = request(Method::GET, "/tasks");
        assert_eq!("tasks", req.service);
        assert_eq!("/", req.path);

        let req = request(Method::GET, "/tasks/");
        assert_eq!("/", req.path);

        assert!(ProxyRequest::from_parts(&Method::GET, &"/".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_unknown_service_skips_resolution() {
        let registry = CountingRegistry::with(vec![instance("task-service", "127.0.0.1", 8001)]);
        let router = GatewayRouter::new(services(), client(registry.clone()));

        for name in ["billing", "task-service", "TASKS", "health"] {
            let req = request(Method::GET, &format!("/{name}/anything"));
            assert_eq!(
                Err(RouteError::UnknownService(name.to_string())),
                router.route(&req).await
            );
        }
        assert_eq!(0, registry.calls());
    }

    #[tokio::test]
    async fn test_known_but_unresolvable_is_unavailable() {
        let registry = CountingRegistry::with(vec![instance("task-service", "127.0.0.1", 8001)]);
        let router = GatewayRouter::new(services(), client(registry.clone()));

        let req = request(Method::GET, "/report/reports");
        assert_eq!(
            Err(RouteError::Unavailable("report".to_string())),
            router.route(&req).await
        );

        let router = GatewayRouter::new(services(), client(CountingRegistry::failing()));
        let req = request(Method::GET, "/tasks/tasks");
        assert_eq!(
            Err(RouteError::Unavailable("tasks".to_string())),
            router.route(&req).await
        );
        assert_eq!(1, registry.calls());
    }

    #[tokio::test]
    async fn test_every_request_resolves() {
        let registry = CountingRegistry::with(vec![
            instance("task-service", "10.0.0.1", 8001),
            instance("project-service", "10.0.0.2", 8002),
        ]);
        let router = GatewayRouter::new(services(), client(registry.clone()));

        let req = request(Method::POST, "/projects/projects");
        for _ in 0..2 {
            let endpoint = router.route(&req).await.unwrap();
            assert_eq!("10.0.0.2:8002", endpoint.to_string());
        }
        assert_eq!(2, registry.calls());
    }
}
