//! Model-side collaborators of the chaining layer.
//!
//! The ORM proper (schemas, property coercion, relations) lives elsewhere;
//! this module carries only what a batch needs to talk to it: the storage
//! adapter interface and a [`ModelClass`] capability exposing CRUD members
//! over any adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::chain::{Capability, Failure, Invocation, Member, OperationError, OperationResult, SetupFault};

pub mod memory;

pub use memory::MemoryAdapter;

/// A stored row
pub type Record = Map<String, Value>;

/// CRUD surface every storage adapter provides
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Insert a record, assigning an id when absent
    async fn create(&self, model: &str, record: Record) -> Result<Record, OperationError>;

    /// Fetch one record by id
    async fn find(&self, model: &str, id: &str) -> Result<Record, OperationError>;

    /// Fetch every record of a model
    async fn all(&self, model: &str) -> Result<Vec<Record>, OperationError>;

    /// Merge `changes` into an existing record
    async fn update(&self, model: &str, id: &str, changes: Record) -> Result<Record, OperationError>;

    /// Remove one record
    async fn destroy(&self, model: &str, id: &str) -> Result<(), OperationError>;

    /// Remove every record of a model, returning how many were removed
    async fn destroy_all(&self, model: &str) -> Result<usize, OperationError>;

    /// Number of stored records
    async fn count(&self, model: &str) -> Result<usize, OperationError>;
}

/// Members a model class exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Find,
    All,
    Count,
    Update,
    Destroy,
    DestroyAll,
}

impl Action {
    fn parse(member: &str) -> Option<Self> {
        match member {
            "create" => Some(Action::Create),
            "find" => Some(Action::Find),
            "all" => Some(Action::All),
            "count" => Some(Action::Count),
            "update" => Some(Action::Update),
            "destroy" => Some(Action::Destroy),
            "destroy_all" => Some(Action::DestroyAll),
            _ => None,
        }
    }

    fn takes_argument(self) -> bool {
        matches!(
            self,
            Action::Create | Action::Find | Action::Update | Action::Destroy
        )
    }
}

struct ModelInner {
    name: String,
    adapter: Arc<dyn StorageAdapter>,
    required: Vec<String>,
}

impl ModelInner {
    /// Every missing required field is reported, not just the first
    fn validate(&self, argument: Value) -> Result<Record, Failure> {
        let record = match argument {
            Value::Object(record) => record,
            other => {
                return Err(OperationError::Validation(format!(
                    "{} expects an object, got {}",
                    self.name, other
                ))
                .into())
            }
        };

        let missing: Vec<OperationError> = self
            .required
            .iter()
            .filter(|field| record.get(*field).map_or(true, Value::is_null))
            .map(|field| OperationError::Validation(format!("{}.{} is required", self.name, field)))
            .collect();

        if missing.is_empty() {
            Ok(record)
        } else {
            Err(Failure::Many(missing))
        }
    }

    async fn perform(&self, action: Action, argument: Option<Value>) -> OperationResult {
        debug!(model = %self.name, action = ?action, "Model call");
        let adapter = &self.adapter;
        let model = self.name.as_str();
        match action {
            Action::Create => {
                let record = self.validate(argument.unwrap_or(Value::Null))?;
                let created = adapter.create(model, record).await?;
                Ok(Some(Value::Object(created)))
            }
            Action::Find => {
                let id = id_of(argument.as_ref())?;
                let record = adapter.find(model, &id).await?;
                Ok(Some(Value::Object(record)))
            }
            Action::All => {
                let records = adapter.all(model).await?;
                Ok(Some(Value::Array(records.into_iter().map(Value::Object).collect())))
            }
            Action::Count => {
                let count = adapter.count(model).await?;
                Ok(Some(Value::from(count)))
            }
            Action::Update => {
                let id = id_of(argument.as_ref())?;
                let mut changes = match argument {
                    Some(Value::Object(changes)) => changes,
                    _ => Record::new(),
                };
                changes.remove("id");
                let record = adapter.update(model, &id, changes).await?;
                Ok(Some(Value::Object(record)))
            }
            Action::Destroy => {
                let id = id_of(argument.as_ref())?;
                adapter.destroy(model, &id).await?;
                Ok(None)
            }
            Action::DestroyAll => {
                let removed = adapter.destroy_all(model).await?;
                Ok(Some(Value::from(removed)))
            }
        }
    }
}

/// Accepts `"id"`, a number, or `{"id": ...}`
fn id_of(argument: Option<&Value>) -> Result<String, OperationError> {
    match argument {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Object(map)) => match map.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(OperationError::Validation("missing id".to_string())),
        },
        _ => Err(OperationError::Validation("missing id".to_string())),
    }
}

struct ModelMember {
    model: Arc<ModelInner>,
    action: Action,
}

impl Member for ModelMember {
    fn invoke(&self, argument: Option<Value>) -> Result<Invocation, SetupFault> {
        match (self.action.takes_argument(), argument.is_some()) {
            (true, false) => {
                return Err(SetupFault::Arity(format!("{:?} requires an argument", self.action)))
            }
            (false, true) => {
                return Err(SetupFault::Arity(format!("{:?} takes no argument", self.action)))
            }
            _ => {}
        }
        let model = Arc::clone(&self.model);
        let action = self.action;
        Ok(Box::pin(async move { model.perform(action, argument).await }))
    }
}

/// A model class as seen by a batch: a named capability over an adapter.
///
/// Members: `create`, `find`, `all`, `count`, `update`, `destroy`,
/// `destroy_all`.
#[derive(Clone)]
pub struct ModelClass {
    inner: Arc<ModelInner>,
}

impl ModelClass {
    /// Bind a model name to an adapter
    pub fn new(name: impl Into<String>, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                name: name.into(),
                adapter,
                required: Vec::new(),
            }),
        }
    }

    /// Reject `create` payloads where `field` is missing or null
    pub fn require(self, field: impl Into<String>) -> Self {
        let ModelInner { name, adapter, mut required } = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => ModelInner {
                name: shared.name.clone(),
                adapter: Arc::clone(&shared.adapter),
                required: shared.required.clone(),
            },
        };
        required.push(field.into());
        Self {
            inner: Arc::new(ModelInner { name, adapter, required }),
        }
    }

    /// Shareable as a batch target
    pub fn into_capability(self) -> Arc<dyn Capability> {
        Arc::new(self)
    }
}

impl Capability for ModelClass {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn resolve(&self, member: &str) -> Result<Arc<dyn Member>, SetupFault> {
        let action = Action::parse(member).ok_or_else(|| SetupFault::UnknownMember {
            target: self.inner.name.clone(),
            member: member.to_string(),
        })?;
        Ok(Arc::new(ModelMember {
            model: Arc::clone(&self.inner),
            action,
        }))
    }
}

impl std::fmt::Debug for ModelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClass")
            .field("name", &self.inner.name)
            .field("required", &self.inner.required)
            .finish()
    }
}
