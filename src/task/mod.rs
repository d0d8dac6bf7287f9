//! The task service, including the per-project bulk delete used by the
//! project service.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Response, StatusCode, Uri};
use matchit::{InsertError, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use serde::Serialize;

use crate::config::TaskRole;
use crate::store::{Repository, StoreError, Task};
use crate::utils::request::{get_query_value, read_request_body};
use crate::utils::response;

enum Resource {
    Collection,
    Item,
}

#[derive(Serialize)]
struct BulkDeleted {
    deleted: usize,
}

pub struct TaskHttpApp {
    tasks: Arc<dyn Repository<Task>>,
    router: Router<Resource>,
}

impl TaskHttpApp {
    pub fn new(tasks: Arc<dyn Repository<Task>>) -> std::result::Result<Self, InsertError> {
        let mut router = Router::new();
        router.insert("/tasks", Resource::Collection)?;
        router.insert("/tasks/{id}", Resource::Item)?;
        Ok(Self { tasks, router })
    }

    pub fn task_http_service(
        cfg: &TaskRole,
        tasks: Arc<dyn Repository<Task>>,
    ) -> Result<Service<Self>> {
        let app = Self::new(tasks).or_err(InternalError, "Failed to build task routes")?;
        let mut service = Service::new("Task HTTP".to_string(), app);
        service.add_tcp(&cfg.address.to_string());
        Ok(service)
    }

    pub async fn handle(&self, method: &Method, uri: &Uri, body: &[u8]) -> Response<Vec<u8>> {
        let matched = match self.router.at(uri.path()) {
            Ok(matched) => matched,
            Err(_) => return response::error(StatusCode::NOT_FOUND, "Not Found"),
        };

        match matched.value {
            Resource::Collection => {
                let project_id = match get_query_value(uri.query(), "project_id")
                    .map(|value| value.parse::<u64>())
                {
                    None => None,
                    Some(Ok(id)) => Some(id),
                    Some(Err(_)) => {
                        return response::error(StatusCode::BAD_REQUEST, "Invalid project_id")
                    }
                };

                match (method, project_id) {
                    (&Method::GET, project_id) => self.list(project_id).await,
                    (&Method::POST, _) => self.create(body).await,
                    (&Method::DELETE, Some(project_id)) => self.delete_project_tasks(project_id).await,
                    (&Method::DELETE, None) => {
                        response::error(StatusCode::BAD_REQUEST, "project_id is required")
                    }
                    _ => response::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
                }
            }
            Resource::Item => {
                let id = match matched.params.get("id").map(str::parse::<u64>) {
                    Some(Ok(id)) => id,
                    _ => return response::error(StatusCode::BAD_REQUEST, "Invalid task id"),
                };
                match *method {
                    Method::GET => self.get(id).await,
                    Method::PUT => self.update(id, body).await,
                    Method::DELETE => self.delete(id).await,
                    _ => response::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
                }
            }
        }
    }

    async fn list(&self, project_id: Option<u64>) -> Response<Vec<u8>> {
        match self.tasks.list().await {
            Ok(mut tasks) => {
                if let Some(project_id) = project_id {
                    tasks.retain(|t| t.project_id == project_id);
                }
                response::json(StatusCode::OK, &tasks)
            }
            Err(e) => storage_error(&e),
        }
    }

    async fn create(&self, body: &[u8]) -> Response<Vec<u8>> {
        let task: Task = match serde_json::from_slice(body) {
            Ok(task) => task,
            Err(e) => return response::error(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()),
        };
        match self.tasks.create(task).await {
            Ok(task) => response::json(StatusCode::OK, &task),
            Err(StoreError::Conflict(id)) => {
                response::error(StatusCode::CONFLICT, &format!("Task {id} already exists"))
            }
            Err(e) => storage_error(&e),
        }
    }

    async fn get(&self, id: u64) -> Response<Vec<u8>> {
        match self.tasks.get(id).await {
            Ok(Some(task)) => response::json(StatusCode::OK, &task),
            Ok(None) => response::error(StatusCode::NOT_FOUND, "Task not found"),
            Err(e) => storage_error(&e),
        }
    }

    async fn update(&self, id: u64, body: &[u8]) -> Response<Vec<u8>> {
        let task: Task = match serde_json::from_slice(body) {
            Ok(task) => task,
            Err(e) => return response::error(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()),
        };
        match self.tasks.update(id, task).await {
            Ok(Some(task)) => response::json(StatusCode::OK, &task),
            Ok(None) => response::error(StatusCode::NOT_FOUND, "Task not found"),
            Err(e) => storage_error(&e),
        }
    }

    async fn delete(&self, id: u64) -> Response<Vec<u8>> {
        match self.tasks.delete(id).await {
            Ok(Some(task)) => response::json(StatusCode::OK, &task),
            Ok(None) => response::error(StatusCode::NOT_FOUND, "Task not found"),
            Err(e) => storage_error(&e),
        }
    }

    async fn delete_project_tasks(&self, project_id: u64) -> Response<Vec<u8>> {
        match self
            .tasks
            .delete_where(&|task: &Task| task.project_id == project_id)
            .await
        {
            Ok(deleted) => {
                log::info!("Deleted {deleted} tasks of project {project_id}");
                response::json(StatusCode::OK, &BulkDeleted { deleted })
            }
            Err(e) => storage_error(&e),
        }
    }
}

fn storage_error(e: &StoreError) -> Response<Vec<u8>> {
    log::error!("Task storage failure: {e}");
    response::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

#[async_trait]
impl ServeHttp for TaskHttpApp {
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
