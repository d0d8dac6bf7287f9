use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::TimeoutPolicy;
use crate::discovery::ServiceEndpoint;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskClientError {
    /// The resolved instance could not be reached at all.
    #[error("task service unreachable: {0}")]
    Unreachable(String),
    /// The task service answered with a non-success status.
    #[error("task deletion rejected with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

/// The calls the project service makes into the task service.
#[async_trait]
pub trait TaskServiceClient: Send + Sync {
    /// Deletes every task of `project_id` in a single request.
    async fn delete_project_tasks(
        &self,
        endpoint: &ServiceEndpoint,
        project_id: u64,
    ) -> Result<usize, TaskClientError>;
}

#[derive(Deserialize)]
struct BulkDeleted {
    deleted: usize,
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

pub struct HttpTaskClient {
    client: Client,
}

impl HttpTaskClient {
    pub fn new(timeouts: &TimeoutPolicy) -> reqwest::Result<Self> {
        Ok(Self {
            client: timeouts.http_client()?,
        })
    }
}

#[async_trait]
impl TaskServiceClient for HttpTaskClient {
    async fn delete_project_tasks(
        &self,
        endpoint: &ServiceEndpoint,
        project_id: u64,
    ) -> Result<usize, TaskClientError> {
        let response = self
            .client
            .delete(endpoint.url(&format!("/tasks?project_id={project_id}")))
            .send()
            .await
            .map_err(|e| TaskClientError::Unreachable(e.to_string()))?;

        // past this point the task service has answered, so the request
        // cannot be reported as unreachable
        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                log::warn!("Bulk delete on {endpoint} answered {status}, body lost: {e}");
                return Ok(0);
            }
            Err(e) => {
                return Err(TaskClientError::Rejected {
                    status: status.as_u16(),
                    detail: e.to_string(),
                })
            }
        };

        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorDetail>(&body)
                .map(|e| e.detail)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(TaskClientError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        match serde_json::from_slice::<BulkDeleted>(&body) {
            Ok(deleted) => Ok(deleted.deleted),
            Err(e) => {
                log::warn!("Unexpected bulk delete answer from {endpoint}: {e}");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use httpmock::prelude::*;

    use super::*;

    fn endpoint(server: &MockServer) -> ServiceEndpoint {
        ServiceEndpoint {
            address: server.host(),
            port: server.port(),
        }
    }

    #[tokio::test]
    async fn test_bulk_delete() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/tasks")
                    .query_param("project_id", "5");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"deleted":3}"#);
            })
            .await;

        let client = HttpTaskClient::new(&TimeoutPolicy::default()).unwrap();
        assert_eq!(
            Ok(3),
            client.delete_project_tasks(&endpoint(&server), 5).await
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bulk_delete_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/tasks");
                then.status(500)
                    .header("content-type", "application/json")
                    .body(r#"{"detail":"database is locked"}"#);
            })
            .await;

        let client = HttpTaskClient::new(&TimeoutPolicy::default()).unwrap();
        assert_eq!(
            Err(TaskClientError::Rejected {
                status: 500,
                detail: "database is locked".to_string()
            }),
            client.delete_project_tasks(&endpoint(&server), 5).await
        );
    }

    /// Answers every connection with `head` and then hangs up mid-body.
    fn truncated_server(head: &'static str) -> ServiceEndpoint {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(head.as_bytes());
            }
        });
        ServiceEndpoint {
            address: "127.0.0.1".to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_body_lost_after_answer() {
        let client = HttpTaskClient::new(&TimeoutPolicy::default()).unwrap();

        let endpoint = truncated_server("HTTP/1.1 200 OK\r\ncontent-length: 64\r\n\r\n{\"dele");
        assert_eq!(Ok(0), client.delete_project_tasks(&endpoint, 5).await);

        let endpoint = truncated_server("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 64\r\n\r\n{");
        assert!(matches!(
            client.delete_project_tasks(&endpoint, 5).await,
            Err(TaskClientError::Rejected { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_delete_unreachable() {
        // bind then release a port so nothing listens on it
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = ServiceEndpoint {
            address: "127.0.0.1".to_string(),
            port,
        };
        let client = HttpTaskClient::new(&TimeoutPolicy {
            connect: Some(1),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            client.delete_project_tasks(&endpoint, 5).await,
            Err(TaskClientError::Unreachable(_))
        ));
    }
}
