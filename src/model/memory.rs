//! In-memory storage adapter backed by a concurrent map

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::chain::OperationError;
use crate::model::{Record, StorageAdapter};

/// In-memory storage adapter
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    tables: Arc<dashmap::DashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryAdapter {
    /// Create an empty adapter
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(model: &str, id: &str) -> OperationError {
    OperationError::NotFound(format!("{} {}", model, id))
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn create(&self, model: &str, mut record: Record) -> Result<Record, OperationError> {
        let id = match record.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut table = self.tables.entry(model.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(OperationError::Storage(format!(
                "{} {} already exists",
                model, id
            )));
        }

        record.insert("id".to_string(), Value::String(id.clone()));
        record.insert("created_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        table.insert(id, record.clone());
        Ok(record)
    }

    async fn find(&self, model: &str, id: &str) -> Result<Record, OperationError> {
        self.tables
            .get(model)
            .and_then(|table| table.get(id).cloned())
            .ok_or_else(|| not_found(model, id))
    }

    async fn all(&self, model: &str) -> Result<Vec<Record>, OperationError> {
        Ok(self
            .tables
            .get(model)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update(&self, model: &str, id: &str, changes: Record) -> Result<Record, OperationError> {
        let mut table = self
            .tables
            .get_mut(model)
            .ok_or_else(|| not_found(model, id))?;
        let record = table.get_mut(id).ok_or_else(|| not_found(model, id))?;
        for (key, value) in changes {
            record.insert(key, value);
        }
        record.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        Ok(record.clone())
    }

    async fn destroy(&self, model: &str, id: &str) -> Result<(), OperationError> {
        self.tables
            .get_mut(model)
            .and_then(|mut table| table.remove(id))
            .map(|_| ())
            .ok_or_else(|| not_found(model, id))
    }

    async fn destroy_all(&self, model: &str) -> Result<usize, OperationError> {
        Ok(self
            .tables
            .remove(model)
            .map(|(_, table)| table.len())
            .unwrap_or(0))
    }

    async fn count(&self, model: &str) -> Result<usize, OperationError> {
        Ok(self.tables.get(model).map(|table| table.len()).unwrap_or(0))
    }
}
