use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::config::{Consul, TimeoutPolicy};

use super::{Registry, RegistryError, ServiceInstance};

/// Registry backed by a Consul agent's service listing.
pub struct ConsulRegistry {
    client: Client,
    url: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
}

impl ConsulRegistry {
    pub fn new(config: &Consul, timeouts: &TimeoutPolicy) -> Result<Self, RegistryError> {
        let url = Url::parse(&config.url).map_err(|e| RegistryError::Malformed(e.to_string()))?;
        let client = timeouts
            .http_client()
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn instances(&self) -> Result<Vec<ServiceInstance>, RegistryError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        parse_agent_services(&body, self.url.host_str().unwrap_or_default())
    }
}

/// Decodes an agent listing, ordered by instance id.
///
/// Consul leaves `Address` empty when the service shares the agent's address,
/// in which case the agent host is used.
fn parse_agent_services(
    body: &[u8],
    agent_host: &str,
) -> Result<Vec<ServiceInstance>, RegistryError> {
    let services: BTreeMap<String, AgentService> =
        serde_json::from_slice(body).map_err(|e| RegistryError::Malformed(e.to_string()))?;

    Ok(services
        .into_values()
        .map(|s| ServiceInstance {
            name: s.service,
            address: if s.address.is_empty() {
                agent_host.to_string()
            } else {
                s.address
            },
            port: s.port,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::discovery::{selection::FirstMatch, RegistryClient};
    use std::sync::Arc;

    const LISTING: &str = r#"{
        "task-service-b": {"ID": "task-service-b", "Service": "task-service", "Address": "10.0.0.7", "Port": 8001},
        "task-service-a": {"ID": "task-service-a", "Service": "task-service", "Address": "10.0.0.5", "Port": 8001},
        "project-service": {"ID": "project-service", "Service": "project-service", "Address": "", "Port": 8002}
    }"#;

    #[test]
    fn test_parse_agent_services() {
        let instances = parse_agent_services(LISTING.as_bytes(), "consul").unwrap();
        assert_eq!(3, instances.len());
        // ordered by instance id
        assert_eq!("consul", instances[0].address);
        assert_eq!("10.0.0.5", instances[1].address);
        assert_eq!("10.0.0.7", instances[2].address);

        assert!(matches!(
            parse_agent_services(b"[]", "consul"),
            Err(RegistryError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_through_consul() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/agent/services");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(LISTING);
            })
            .await;

        let registry = ConsulRegistry::new(
            &Consul {
                url: server.url("/v1/agent/services"),
            },
            &TimeoutPolicy::default(),
        )
        .unwrap();
        let client = RegistryClient::new(Arc::new(registry), Arc::new(FirstMatch));

        let endpoint = client.resolve("task-service").await.unwrap();
        assert_eq!("10.0.0.5:8001", endpoint.to_string());
        assert!(client.resolve("schedule-service").await.is_none());
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn test_registry_error_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/agent/services");
                then.status(500);
            })
            .await;

        let registry = ConsulRegistry::new(
            &Consul {
                url: server.url("/v1/agent/services"),
            },
            &TimeoutPolicy::default(),
        )
        .unwrap();
        let client = RegistryClient::new(Arc::new(registry), Arc::new(FirstMatch));
        assert!(client.resolve("task-service").await.is_none());
    }
}
