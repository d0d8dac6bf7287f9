//! Storage abstraction injected into the project and task services.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    Conflict(u64),
    #[error("no id left to assign after {0}")]
    IdsExhausted(u64),
    #[error("storage failure: {0}")]
    Backend(String),
}

/// A record addressable by a numeric id.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: u64,
    pub name: String,
}

impl Record for Project {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub project_id: u64,
    #[serde(default)]
    pub is_done: bool,
}

impl Record for Task {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// create/read/update/delete/list over one kind of record.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    async fn list(&self) -> Result<Vec<T>, StoreError>;

    async fn get(&self, id: u64) -> Result<Option<T>, StoreError>;

    /// Stores a new record. An id of `0` asks the store to assign one.
    async fn create(&self, record: T) -> Result<T, StoreError>;

    /// Replaces an existing record, `None` if there is nothing to replace.
    async fn update(&self, id: u64, record: T) -> Result<Option<T>, StoreError>;

    /// Removes a record, returning it if it existed.
    async fn delete(&self, id: u64) -> Result<Option<T>, StoreError>;

    /// Removes every record matching `predicate`, returning how many went.
    async fn delete_where(
        &self,
        predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    ) -> Result<usize, StoreError>;
}

/// Process-local repository.
pub struct MemoryRepository<T> {
    records: RwLock<BTreeMap<u64, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get(&self, id: u64) -> Result<Option<T>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn create(&self, mut record: T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        if record.id() == 0 {
            let next = match records.keys().next_back() {
                Some(&last) => last.checked_add(1).ok_or(StoreError::IdsExhausted(last))?,
                None => 1,
            };
            record.set_id(next);
        } else if records.contains_key(&record.id()) {
            return Err(StoreError::Conflict(record.id()));
        }
        records.insert(record.id(), record.clone());
        Ok(record)
    }

    async fn update(&self, id: u64, mut record: T) -> Result<Option<T>, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(existing) => {
                record.set_id(id);
                *existing = record.clone();
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: u64) -> Result<Option<T>, StoreError> {
        Ok(self.records.write().await.remove(&id))
    }

    async fn delete_where(
        &self,
        predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    ) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !predicate(record));
        Ok(before - records.len())
    }
}
