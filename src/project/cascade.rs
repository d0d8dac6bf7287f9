//! Deleting a project together with the tasks the task service holds for it.
//!
//! The tasks go first, then the project. This is not a two-phase commit: when
//! the local delete fails after the tasks are gone, the project stays behind
//! without tasks and the storage error is reported as such.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::discovery::RegistryClient;
use crate::store::{Project, Repository, StoreError};

use super::task_client::{TaskClientError, TaskServiceClient};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteProjectCommand {
    pub project_id: u64,
    pub with_tasks: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeStage {
    ProjectLookup,
    TaskServiceResolve,
    TaskBulkDelete,
    ProjectDelete,
    Done,
}

impl fmt::Display for CascadeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            CascadeStage::ProjectLookup => "project lookup",
            CascadeStage::TaskServiceResolve => "task service resolve",
            CascadeStage::TaskBulkDelete => "task bulk delete",
            CascadeStage::ProjectDelete => "project delete",
            CascadeStage::Done => "done",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("Project {0} not found")]
    NotFound(u64),
    /// Nothing was mutated.
    #[error("Task service unreachable: {0}")]
    DependencyUnavailable(String),
    /// Nothing was mutated locally; the task service may have done part of the work.
    #[error("Task deletion rejected: {0}")]
    DependencyFailure(String),
    #[error("Project storage failure: {0}")]
    Storage(#[from] StoreError),
}

pub struct CascadeDelete {
    projects: Arc<dyn Repository<Project>>,
    registry: RegistryClient,
    tasks: Arc<dyn TaskServiceClient>,
    task_service: String,
}

impl CascadeDelete {
    pub fn new(
        projects: Arc<dyn Repository<Project>>,
        registry: RegistryClient,
        tasks: Arc<dyn TaskServiceClient>,
        task_service: String,
    ) -> Self {
        Self {
            projects,
            registry,
            tasks,
            task_service,
        }
    }

    pub async fn execute(&self, command: DeleteProjectCommand) -> Result<Project, DeleteError> {
        if command.with_tasks {
            self.delete_with_tasks(command.project_id).await
        } else {
            self.projects
                .delete(command.project_id)
                .await?
                .ok_or(DeleteError::NotFound(command.project_id))
        }
    }

    async fn delete_with_tasks(&self, id: u64) -> Result<Project, DeleteError> {
        stage(id, CascadeStage::ProjectLookup);
        if self.projects.get(id).await?.is_none() {
            return Err(DeleteError::NotFound(id));
        }

        stage(id, CascadeStage::TaskServiceResolve);
        let endpoint = self
            .registry
            .resolve(&self.task_service)
            .await
            .ok_or_else(|| DeleteError::DependencyUnavailable(self.task_service.clone()))?;

        stage(id, CascadeStage::TaskBulkDelete);
        match self.tasks.delete_project_tasks(&endpoint, id).await {
            Ok(deleted) => log::info!("Deleted {deleted} tasks of project {id} on {endpoint}"),
            Err(TaskClientError::Unreachable(e)) => {
                log::warn!("Task service at {endpoint} unreachable, project {id} kept: {e}");
                return Err(DeleteError::DependencyUnavailable(format!(
                    "{} at {endpoint}",
                    self.task_service
                )));
            }
            Err(e @ TaskClientError::Rejected { .. }) => {
                log::warn!("Task deletion for project {id} failed, project kept: {e}");
                return Err(DeleteError::DependencyFailure(e.to_string()));
            }
        }

        stage(id, CascadeStage::ProjectDelete);
        match self.projects.delete(id).await {
            Ok(Some(project)) => {
                stage(id, CascadeStage::Done);
                Ok(project)
            }
            Ok(None) => Err(DeleteError::NotFound(id)),
            Err(e) => {
                log::error!("Tasks of project {id} deleted but the project was not: {e}");
                Err(DeleteError::Storage(e))
            }
        }
    }
}

fn stage(id: u64, stage: CascadeStage) {
    log::debug!("Cascading delete of project {id}: {stage}");
}
