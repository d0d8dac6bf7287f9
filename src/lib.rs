//! Pingmesh: a service-discovery gateway in front of a project service and a
//! task service.
//!
//! One binary hosts any combination of the three roles, each as a pingora
//! service. Downstream instances are looked up in a registry (static, etcd or
//! Consul) on every call.

pub mod config;
pub mod discovery;
pub mod gateway;
pub mod logging;
pub mod project;
pub mod store;
pub mod task;
pub mod utils;
