//! Tool catalog
//!
//! The fixed set of `namespace.action -> implementation` pairs an authority
//! can hand out. Built once with [`CatalogBuilder`] and immutable afterwards.

use crate::permission::{PermissionError, PermissionId};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a tool implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    /// Error relayed from the other side of the broker
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn code(&self) -> &str {
        match self {
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::Failed(_) => "ToolExecutionFailed",
            Self::Remote { code, .. } => code,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error(transparent)]
    Malformed(#[from] PermissionError),

    #[error("Tool '{0}' registered twice")]
    Duplicate(String),
}

/// One tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;

    /// One-line description shown by `capgate catalog`
    fn description(&self) -> Option<&str> {
        None
    }
}

/// Adapt an async closure into a [`ToolHandler`]
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnTool(f))
}

struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.0)(arguments).await
    }
}

/// Catalog entry as listed to operators and workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub id: PermissionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Default)]
pub struct CatalogBuilder {
    namespaces: BTreeMap<String, BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `namespace.action`
    pub fn register(
        &mut self,
        id: &str,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<&mut Self, CatalogError> {
        let id = PermissionId::parse(id)?;
        let (namespace, action) = id
            .parts()
            .ok_or_else(|| PermissionError::Malformed(id.to_string()))?;
        let actions = self.namespaces.entry(namespace.to_string()).or_default();
        if actions.contains_key(action) {
            return Err(CatalogError::Duplicate(id.to_string()));
        }
        actions.insert(action.to_string(), handler);
        Ok(self)
    }

    pub fn build(self) -> CapabilityCatalog {
        CapabilityCatalog {
            namespaces: self.namespaces,
        }
    }
}

/// Immutable `namespace -> action -> handler` map
#[derive(Clone, Default)]
pub struct CapabilityCatalog {
    namespaces: BTreeMap<String, BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl CapabilityCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    pub fn get(&self, namespace: &str, action: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.namespaces.get(namespace)?.get(action)
    }

    pub fn lookup(&self, id: &PermissionId) -> Option<&Arc<dyn ToolHandler>> {
        let (namespace, action) = id.parts()?;
        self.get(namespace, action)
    }

    pub fn contains(&self, id: &PermissionId) -> bool {
        self.lookup(id).is_some()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Every `(namespace, action, handler)` triple, sorted
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Arc<dyn ToolHandler>)> {
        self.namespaces.iter().flat_map(|(namespace, actions)| {
            actions
                .iter()
                .map(move |(action, handler)| (namespace.as_str(), action.as_str(), handler))
        })
    }

    pub fn ids(&self) -> Vec<PermissionId> {
        self.entries()
            .map(|(namespace, action, _)| PermissionId::from_parts(namespace, action))
            .collect()
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.entries()
            .map(|(namespace, action, handler)| ToolInfo {
                id: PermissionId::from_parts(namespace, action),
                description: handler.description().map(str::to_string),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CapabilityCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn ToolHandler> {
        tool_fn(|args| async move { Ok(args) })
    }

    #[test]
    fn test_register_groups_by_namespace() {
        let mut builder = CapabilityCatalog::builder();
        builder
            .register("fs.read", echo())
            .unwrap()
            .register("fs.write", echo())
            .unwrap()
            .register("github.repos.get", echo())
            .unwrap();
        let catalog = builder.build();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.namespaces().collect::<Vec<_>>(), vec!["fs", "github"]);
        assert!(catalog.get("github", "repos.get").is_some());
        assert!(catalog.contains(&PermissionId::new("fs.write")));
        assert!(!catalog.contains(&PermissionId::new("fs.delete")));
    }

    #[test]
    fn test_register_rejects_malformed_and_duplicates() {
        let mut builder = CatalogBuilder::new();
        assert!(matches!(
            builder.register("noseparator", echo()),
            Err(CatalogError::Malformed(_))
        ));
        builder.register("fs.read", echo()).unwrap();
        assert_eq!(
            builder.register("fs.read", echo()).err(),
            Some(CatalogError::Duplicate("fs.read".to_string()))
        );
    }

    #[tokio::test]
    async fn test_lookup_reaches_handler() {
        let mut builder = CatalogBuilder::new();
        builder.register("math.echo", echo()).unwrap();
        let catalog = builder.build();

        let handler = catalog.lookup(&PermissionId::new("math.echo")).unwrap();
        assert_eq!(handler.call(json!({"x": 1})).await, Ok(json!({"x": 1})));
        assert!(catalog.get("math", "nope").is_none());
        assert!(catalog.lookup(&PermissionId::new("mathecho")).is_none());
    }

    #[test]
    fn test_tool_error_codes() {
        assert_eq!(ToolError::failed("boom").code(), "ToolExecutionFailed");
        let remote = ToolError::Remote {
            code: "PermissionDenied".to_string(),
            message: "no".to_string(),
        };
        assert_eq!(remote.code(), "PermissionDenied");
    }
}
