#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::{
    apps::HttpServerOptions,
    listeners::tls::TlsSettings,
    server::{configuration::Opt, Server},
};
use pingora_proxy::{http_proxy_service_with_name, HttpProxy};

use pingmesh::{
    config::{self, Config},
    discovery::RegistryClient,
    gateway::{proxy::GatewayService, GatewayRouter},
    logging::FileLogger,
    project::ProjectHttpApp,
    store::{MemoryRepository, Project, Task},
    task::TaskHttpApp,
};

const GATEWAY_SERVICE: &str = "pingmesh";

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = if let Some(log_cfg) = &config.log {
        let logger = FileLogger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    let registry = match RegistryClient::from_config(&config.registry, &config.timeouts) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to build registry client: {e}");
            std::process::exit(1);
        }
    };

    let mut pingmesh_server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log file service...");
        pingmesh_server.add_service(log_service);
    }

    if let Some(tasks_cfg) = &config.tasks {
        log::info!("Adding task service on {}...", tasks_cfg.address);
        let tasks = Arc::new(MemoryRepository::<Task>::default());
        match TaskHttpApp::task_http_service(tasks_cfg, tasks) {
            Ok(service) => pingmesh_server.add_service(service),
            Err(e) => {
                eprintln!("Failed to build task service: {e}");
                std::process::exit(1);
            }
        }
    }

    if let Some(projects_cfg) = &config.projects {
        log::info!("Adding project service on {}...", projects_cfg.address);
        let projects = Arc::new(MemoryRepository::<Project>::default());
        match ProjectHttpApp::project_http_service(
            projects_cfg,
            projects,
            registry.clone(),
            &config.timeouts,
        ) {
            Ok(service) => pingmesh_server.add_service(service),
            Err(e) => {
                eprintln!("Failed to build project service: {e}");
                std::process::exit(1);
            }
        }
    }

    let gateway_service = config.gateway.as_ref().map(|gateway_cfg| {
        let router = GatewayRouter::new(gateway_cfg.services.clone(), registry.clone());
        let mut http_service = http_proxy_service_with_name(
            &pingmesh_server.configuration,
            GatewayService::new(router, config.timeouts),
            GATEWAY_SERVICE,
        );

        log::info!("Adding gateway listeners...");
        if let Err(e) = add_listeners(&mut http_service, gateway_cfg) {
            eprintln!("Failed to add listeners: {e}");
            std::process::exit(1);
        }
        http_service
    });

    log::info!("Bootstrapping...");
    pingmesh_server.bootstrap();

    if let Some(http_service) = gateway_service {
        log::info!("Bootstrapped. Adding gateway...");
        pingmesh_server.add_service(http_service);
    }

    log::info!("Starting Server...");
    pingmesh_server.run_forever();
}

/// Add listeners for the gateway, supporting TCP and TLS
fn add_listeners(
    http_service: &mut Service<HttpProxy<GatewayService>>,
    cfg: &config::Gateway,
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in cfg.listeners.iter() {
        if let Some(tls) = &list_cfg.tls {
            let mut tls_settings = TlsSettings::intermediate(&tls.cert_path, &tls.key_path)?;
            if list_cfg.offer_h2 {
                tls_settings.enable_h2();
            }
            http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, tls_settings);
        } else {
            if list_cfg.offer_h2c {
                let http_logic = http_service
                    .app_logic_mut()
                    .ok_or("Failed to get app logic")?;
                let mut http_server_options = HttpServerOptions::default();
                http_server_options.h2c = true;
                http_logic.server_options = Some(http_server_options);
            }
            http_service.add_tcp(&list_cfg.address.to_string());
        }
    }
    Ok(())
}
