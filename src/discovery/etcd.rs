use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use tokio::sync::Mutex;

use crate::config::Etcd;

use super::{Registry, RegistryError, ServiceInstance};

/// Registry kept in etcd.
///
/// Each instance is one key under the configured prefix whose value is a
/// JSON document: `{"name": "task-service", "address": "10.0.0.1", "port": 8001}`.
pub struct EtcdRegistry {
    config: Etcd,
    client: Mutex<Option<Client>>,
}

impl EtcdRegistry {
    pub fn new(config: Etcd) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    async fn create_client(&self) -> Result<Client, etcd_client::Error> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        Client::connect(self.config.host.clone(), Some(options)).await
    }

    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>, etcd_client::Error> {
        let mut client = {
            let mut client_guard = self.client.lock().await;
            match client_guard.as_ref() {
                Some(client) => client.clone(),
                None => {
                    log::info!("Creating new etcd client...");
                    let client = self.create_client().await?;
                    *client_guard = Some(client.clone());
                    client
                }
            }
        };

        let options = GetOptions::new().with_prefix();
        match client.get(self.config.prefix.as_bytes(), Some(options)).await {
            Ok(response) => Ok(response
                .kvs()
                .iter()
                .map(|kv| {
                    (
                        String::from_utf8_lossy(kv.key()).into_owned(),
                        kv.value().to_vec(),
                    )
                })
                .collect()),
            Err(e) => {
                // reconnect on the next lookup
                *self.client.lock().await = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn instances(&self) -> Result<Vec<ServiceInstance>, RegistryError> {
        let entries = self
            .list()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        Ok(parse_instances(&entries))
    }
}

/// Decodes instance entries in key order, skipping entries that are not valid.
fn parse_instances(entries: &[(String, Vec<u8>)]) -> Vec<ServiceInstance> {
    entries
        .iter()
        .filter_map(
            |(key, value)| match serde_json::from_slice::<ServiceInstance>(value) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    log::warn!("Skipping malformed registry entry '{key}': {e}");
                    None
                }
            },
        )
        .collect()
}
