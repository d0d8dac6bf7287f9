//! The project-owning service.

pub mod cascade;
pub mod task_client;

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Response, StatusCode, Uri};
use matchit::{InsertError, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use serde::Deserialize;

use crate::config::{ProjectRole, TimeoutPolicy};
use crate::discovery::RegistryClient;
use crate::store::{Project, Repository};
use crate::utils::request::{get_query_value, parse_bool, read_request_body};
use crate::utils::response;

use cascade::{CascadeDelete, DeleteError, DeleteProjectCommand};
use task_client::HttpTaskClient;

enum Resource {
    Collection,
    Item,
}

#[derive(Deserialize)]
struct NewProject {
    name: String,
}

pub struct ProjectHttpApp {
    projects: Arc<dyn Repository<Project>>,
    cascade: CascadeDelete,
    router: Router<Resource>,
}

impl ProjectHttpApp {
    pub fn new(
        projects: Arc<dyn Repository<Project>>,
        cascade: CascadeDelete,
    ) -> std::result::Result<Self, InsertError> {
        let mut router = Router::new();
        router.insert("/projects", Resource::Collection)?;
        router.insert("/projects/{id}", Resource::Item)?;

        Ok(Self {
            projects,
            cascade,
            router,
        })
    }

    pub fn project_http_service(
        cfg: &ProjectRole,
        projects: Arc<dyn Repository<Project>>,
        registry: RegistryClient,
        timeouts: &TimeoutPolicy,
    ) -> Result<Service<Self>> {
        let tasks = HttpTaskClient::new(timeouts)
            .or_err(InternalError, "Failed to build task service client")?;
        let cascade = CascadeDelete::new(
            projects.clone(),
            registry,
            Arc::new(tasks),
            cfg.task_service.clone(),
        );
        let app = Self::new(projects, cascade)
            .or_err(InternalError, "Failed to build project routes")?;

        let mut service = Service::new("Project HTTP".to_string(), app);
        service.add_tcp(&cfg.address.to_string());
        Ok(service)
    }

    pub async fn handle(&self, method: &Method, uri: &Uri, body: &[u8]) -> Response<Vec<u8>> {
        let matched = match self.router.at(uri.path()) {
            Ok(matched) => matched,
            Err(_) => return response::error(StatusCode::NOT_FOUND, "Not Found"),
        };

        match (matched.value, method) {
            (Resource::Collection, &Method::GET) => self.list().await,
            (Resource::Collection, &Method::POST) => self.create(uri, body).await,
            (Resource::Item, method) => {
                let id = match matched.params.get("id").map(str::parse::<u64>) {
                    Some(Ok(id)) => id,
                    _ => return response::error(StatusCode::BAD_REQUEST, "Invalid project id"),
                };
                match *method {
                    Method::GET => self.get(id).await,
                    Method::DELETE => self.delete(id, uri).await,
                    _ => response::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
                }
            }
            _ => response::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
        }
    }

    async fn list(&self) -> Response<Vec<u8>> {
        match self.projects.list().await {
            Ok(projects) => response::json(StatusCode::OK, &projects),
            Err(e) => response::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    /// Accepts `{"name": ...}` or, with an empty body, `?name=...`.
    async fn create(&self, uri: &Uri, body: &[u8]) -> Response<Vec<u8>> {
        let name = if body.is_empty() {
            get_query_value(uri.query(), "name")
        } else {
            serde_json::from_slice::<NewProject>(body)
                .ok()
                .map(|p| p.name)
        };
        let Some(name) = name else {
            return response::error(StatusCode::BAD_REQUEST, "Project name is required");
        };

        match self.projects.create(Project { id: 0, name }).await {
            Ok(project) => response::json(StatusCode::OK, &project),
            Err(e) => response::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    async fn get(&self, id: u64) -> Response<Vec<u8>> {
        match self.projects.get(id).await {
            Ok(Some(project)) => response::json(StatusCode::OK, &project),
            Ok(None) => response::error(StatusCode::NOT_FOUND, "Project not found"),
            Err(e) => response::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    async fn delete(&self, id: u64, uri: &Uri) -> Response<Vec<u8>> {
        let with_tasks = match get_query_value(uri.query(), "withTasks") {
            None => false,
            Some(value) => match parse_bool(&value) {
                Some(flag) => flag,
                None => {
                    return response::error(StatusCode::BAD_REQUEST, "Invalid withTasks value")
                }
            },
        };

        let command = DeleteProjectCommand {
            project_id: id,
            with_tasks,
        };
        match self.cascade.execute(command).await {
            Ok(project) => response::json(StatusCode::OK, &project),
            Err(e) => response::error(delete_error_status(&e), &e.to_string()),
        }
    }
}

pub fn delete_error_status(e: &DeleteError) -> StatusCode {
    match e {
        DeleteError::NotFound(_) => StatusCode::NOT_FOUND,
        DeleteError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DeleteError::DependencyFailure(_) | DeleteError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[async_trait]
impl ServeHttp for ProjectHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (method, uri) = {
            let req_header = http_session.req_header();
            (req_header.method.clone(), req_header.uri.clone())
        };

        let body = match read_request_body(http_session).await {
            Ok(body) => body,
            Err(e) => return response::error(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let resp = self.handle(&method, &uri, &body).await;
        log::info!("{method} {uri} {}", resp.status().as_u16());
        resp
    }
}
