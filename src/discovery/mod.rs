//! Registry-backed service discovery.
//!
//! Every lookup queries the registry afresh. Resolved endpoints are handed to
//! the caller and never kept, so routing always follows the registry's
//! current view.

pub mod consul;
pub mod etcd;
pub mod selection;

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{self, RegistryBackend, TimeoutPolicy};

use consul::ConsulRegistry;
use etcd::EtcdRegistry;
use selection::{build_strategy, SelectionStrategy};

static GLOBAL_RESOLVER: OnceCell<TokioAsyncResolver> = OnceCell::new();

fn get_global_resolver() -> &'static TokioAsyncResolver {
    GLOBAL_RESOLVER.get_or_init(|| {
        TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            log::warn!("Falling back to default resolver config: {e}");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        })
    })
}

/// One registered instance of a named service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// A resolved network location, valid for the request that resolved it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub address: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn url(&self, path: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.address,
            self.port,
            path.trim_start_matches('/')
        )
    }

    /// Resolves the endpoint's host to a socket address.
    ///
    /// IP literals are used as-is; host names go through the shared resolver.
    pub async fn socket_addr(&self) -> Result<SocketAddr, RegistryError> {
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let ip = get_global_resolver()
            .lookup_ip(self.address.as_str())
            .await
            .map_err(|e| RegistryError::Unreachable(format!("{}: {e}", self.address)))?
            .iter()
            .next()
            .ok_or_else(|| RegistryError::Malformed(format!("no address for {}", self.address)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl From<&ServiceInstance> for ServiceEndpoint {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            address: instance.address.clone(),
            port: instance.port,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("malformed registry answer: {0}")]
    Malformed(String),
}

/// A source of currently registered service instances.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn instances(&self) -> Result<Vec<ServiceInstance>, RegistryError>;
}

/// Instances fixed at startup.
#[derive(Default)]
pub struct StaticRegistry {
    instances: Vec<ServiceInstance>,
}

impl StaticRegistry {
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn instances(&self) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self.instances.clone())
    }
}

/// Resolves service names to endpoints.
///
/// Registry failures, malformed answers and missing registrations all come
/// back as `None`. Callers cannot tell "registry down" from "not registered";
/// they only decide how to fail. There is no retry.
#[derive(Clone)]
pub struct RegistryClient {
    registry: Arc<dyn Registry>,
    strategy: Arc<dyn SelectionStrategy>,
}

impl RegistryClient {
    pub fn new(registry: Arc<dyn Registry>, strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self { registry, strategy }
    }

    /// Builds the client described by the `registry` section of the config.
    pub fn from_config(
        cfg: &config::Registry,
        timeouts: &TimeoutPolicy,
    ) -> Result<Self, RegistryError> {
        let registry: Arc<dyn Registry> = match &cfg.backend {
            RegistryBackend::Static { instances } => {
                Arc::new(StaticRegistry::new(instances.clone()))
            }
            RegistryBackend::Etcd(etcd) => Arc::new(EtcdRegistry::new(etcd.clone())),
            RegistryBackend::Consul(consul) => Arc::new(ConsulRegistry::new(consul, timeouts)?),
        };
        Ok(Self::new(registry, build_strategy(cfg.selection)))
    }

    pub async fn resolve(&self, service_name: &str) -> Option<ServiceEndpoint> {
        let instances = match self.registry.instances().await {
            Ok(instances) => instances,
            Err(e) => {
                log::warn!("Resolving '{service_name}' failed: {e}");
                return None;
            }
        };

        let candidates: Vec<ServiceInstance> = instances
            .into_iter()
            .filter(|instance| instance.name == service_name)
            .collect();

        match self.strategy.select(&candidates) {
            Some(instance) => {
                let endpoint = ServiceEndpoint::from(instance);
                log::debug!("Resolved '{service_name}' to {endpoint}");
                Some(endpoint)
            }
            None => {
                log::warn!("No registered instance for '{service_name}'");
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_resolve_first_match() {
        let registry = CountingRegistry::with(vec![
            instance("project-service", "10.0.0.2", 8002),
            instance("task-service", "10.0.0.1", 8001),
            instance("task-service", "10.0.0.9", 9001),
        ]);
        let client = client(registry.clone());

        let endpoint = client.resolve("task-service").await.unwrap();
        assert_eq!("10.0.0.1:8001", endpoint.to_string());
        assert_eq!(1, registry.calls());
    }

    #[tokio::test]
    async fn test_resolve_never_caches() {
        let registry = CountingRegistry::with(vec![instance("task-service", "10.0.0.1", 8001)]);
        let client = client(registry.clone());

        for _ in 0..3 {
            assert!(client.resolve("task-service").await.is_some());
        }
        assert_eq!(3, registry.calls());
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let registry = CountingRegistry::with(vec![instance("task-service", "10.0.0.1", 8001)]);
        assert!(client(registry).resolve("report-service").await.is_none());

        let registry = CountingRegistry::failing();
        assert!(client(registry.clone()).resolve("task-service").await.is_none());
        assert_eq!(1, registry.calls());
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = ServiceEndpoint {
            address: "task-service".to_string(),
            port: 8001,
        };
        assert_eq!("http://task-service:8001/tasks", endpoint.url("/tasks"));
        assert_eq!("http://task-service:8001/tasks", endpoint.url("tasks"));
        assert_eq!("http://task-service:8001/", endpoint.url(""));
    }

    #[tokio::test]
    async fn test_static_registry_from_config() {
        let cfg = config::Registry {
            backend: RegistryBackend::Static {
                instances: vec![instance("task-service", "127.0.0.1", 8001)],
            },
            selection: config::SelectionType::FirstMatch,
        };
        let client = RegistryClient::from_config(&cfg, &TimeoutPolicy::default()).unwrap();
        let endpoint = client.resolve("task-service").await.unwrap();
        assert_eq!(
            "127.0.0.1:8001".parse::<SocketAddr>().unwrap(),
            endpoint.socket_addr().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_socket_addr_by_name() {
        let endpoint = ServiceEndpoint {
            address: "localhost".to_string(),
            port: 8001,
        };
        let addr = endpoint.socket_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(8001, addr.port());

        let endpoint = ServiceEndpoint {
            address: "no-such-host.invalid".to_string(),
            port: 8001,
        };
        assert!(endpoint.socket_addr().await.is_err());
    }
}
