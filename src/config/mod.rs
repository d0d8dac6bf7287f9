use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::discovery::ServiceInstance;

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_roles_and_registry"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    pub log: Option<Log>,

    #[serde(default)]
    pub registry: Registry,

    #[serde(default)]
    pub timeouts: TimeoutPolicy,

    #[validate(nested)]
    pub gateway: Option<Gateway>,
    pub projects: Option<ProjectRole>,
    pub tasks: Option<TaskRole>,
}

// Config file load and validation
impl Config {
    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_roles_and_registry(&self) -> Result<(), ValidationError> {
        if self.gateway.is_none() && self.projects.is_none() && self.tasks.is_none() {
            return Err(ValidationError::new("at_least_one_role_required"));
        }

        match &self.registry.backend {
            RegistryBackend::Etcd(etcd) if etcd.host.is_empty() => {
                Err(ValidationError::new("etcd_host_required"))
            }
            RegistryBackend::Consul(consul) if reqwest::Url::parse(&consul.url).is_err() => {
                Err(ValidationError::new("invalid_consul_url"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "Log::default_level")]
    pub level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Where service instances are looked up and how one is picked among several.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Registry {
    #[serde(flatten)]
    pub backend: RegistryBackend,
    #[serde(default)]
    pub selection: SelectionType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryBackend {
    Static {
        #[serde(default)]
        instances: Vec<ServiceInstance>,
    },
    Etcd(Etcd),
    Consul(Consul),
}

impl Default for RegistryBackend {
    fn default() -> Self {
        RegistryBackend::Static {
            instances: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Etcd {
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Etcd {
    fn default_prefix() -> String {
        "/pingmesh/services".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Consul {
    /// Full URL of the agent services listing, e.g. `http://consul:8500/v1/agent/services`.
    pub url: String,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionType {
    #[default]
    FirstMatch,
    RoundRobin,
    Random,
}

/// Timeouts, in seconds, applied to every outbound call.
///
/// A field left unset keeps the default of the underlying transport.
#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub connect: Option<u64>,
    pub send: Option<u64>,
    pub read: Option<u64>,
    pub total: Option<u64>,
}

impl TimeoutPolicy {
    pub fn connect(&self) -> Option<Duration> {
        self.connect.map(Duration::from_secs)
    }

    pub fn send(&self) -> Option<Duration> {
        self.send.map(Duration::from_secs)
    }

    pub fn read(&self) -> Option<Duration> {
        self.read.map(Duration::from_secs)
    }

    pub fn total(&self) -> Option<Duration> {
        self.total.map(Duration::from_secs)
    }

    /// Builds an HTTP client honouring the policy.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let Some(connect) = self.connect() {
            builder = builder.connect_timeout(connect);
        }
        if let Some(read) = self.read() {
            builder = builder.read_timeout(read);
        }
        if let Some(total) = self.total() {
            builder = builder.timeout(total);
        }
        builder.build()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    /// Logical route prefix to registry service name, e.g. `tasks: task-service`.
    #[validate(length(min = 1))]
    pub services: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRole {
    pub address: SocketAddr,
    #[serde(default = "ProjectRole::default_task_service")]
    pub task_service: String,
}

impl ProjectRole {
    fn default_task_service() -> String {
        "task-service".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRole {
    pub address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  threads: 2

registry:
  kind: static
  selection: round_robin
  instances:
    - name: task-service
      address: 127.0.0.1
      port: 8001
    - name: project-service
      address: 127.0.0.1
      port: 8002

timeouts:
  connect: 2
  read: 10

gateway:
  listeners:
    - address: 0.0.0.0:8000
  services:
    tasks: task-service
    projects: project-service

projects:
  address: 0.0.0.0:8002

tasks:
  address: 0.0.0.0:8001
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.pingora.threads);
        assert_eq!(SelectionType::RoundRobin, conf.registry.selection);
        match &conf.registry.backend {
            RegistryBackend::Static { instances } => assert_eq!(2, instances.len()),
            other => panic!("unexpected backend {other:?}"),
        }
        assert_eq!(Some(Duration::from_secs(2)), conf.timeouts.connect());
        assert_eq!(None, conf.timeouts.total());

        let gateway = conf.gateway.unwrap();
        assert_eq!("task-service", gateway.services["tasks"]);
        assert_eq!("task-service", conf.projects.unwrap().task_service);
        assert!(conf.tasks.is_some());
    }

    #[test]
    fn test_shipped_config() {
        init_log();
        let conf = Config::from_yaml(include_str!("../../conf/pingmesh.yaml")).unwrap();
        assert!(conf.log.is_none());
        assert_eq!(Some(Duration::from_secs(30)), conf.timeouts.total());
        assert_eq!(2, conf.gateway.unwrap().services.len());

        let conf_str = r#"
log:
  path: /tmp/pingmesh.log
tasks:
  address: 0.0.0.0:8001
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!("info", conf.log.unwrap().level);
    }

    #[test]
    fn test_etcd_registry() {
        init_log();
        let conf_str = r#"
registry:
  kind: etcd
  host:
    - http://127.0.0.1:2379
tasks:
  address: 0.0.0.0:8001
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(SelectionType::FirstMatch, conf.registry.selection);
        match conf.registry.backend {
            RegistryBackend::Etcd(etcd) => assert_eq!("/pingmesh/services", etcd.prefix),
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_invalid_configs() {
        init_log();

        // no role
        assert!(Config::from_yaml("registry:\n  kind: static\n").is_err());

        // gateway without services
        let conf_str = r#"
gateway:
  listeners:
    - address: 0.0.0.0:8000
  services: {}
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        // h2 without tls
        let conf_str = r#"
gateway:
  listeners:
    - address: 0.0.0.0:8000
      offer_h2: true
  services:
    tasks: task-service
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
registry:
  kind: consul
  url: not a url
tasks:
  address: 0.0.0.0:8001
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
