//! Capability authority and capability objects
//!
//! An [`Authority`] owns one seal and one catalog. [`Authority::grant`] turns a
//! list of permission ids into a [`CapabilityObject`] that exposes the whole
//! catalog shape, but where every ungranted action refuses to run.
//!
//! Every action remembers the seal of the authority that issued it. A call
//! checks, in order:
//!
//! 1. the issuer seal equals the seal of the object it was called through,
//! 2. the id is in the object's grant,
//! 3. then delegates to the catalog handler and returns its result unchanged.
//!
//! Objects are immutable: state sits behind `Arc` and nothing takes `&mut`.

use crate::catalog::{CapabilityCatalog, ToolError, ToolHandler};
use crate::permission::{PermissionId, PermissionSet};
use capgate_crypto::{Seal, SealError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Malformed permission id '{0}': expected 'namespace.action'")]
    MalformedPermissionId(String),

    #[error("Capability object was not issued by the authority that owns this action")]
    InvalidCapabilityObject,

    #[error("Permission denied: {} not granted (granted: {})", join(.missing), join(.granted))]
    PermissionDenied {
        missing: Vec<PermissionId>,
        granted: Vec<PermissionId>,
    },

    #[error("Unknown operation '{0}'")]
    UnknownOperation(PermissionId),

    #[error("Tool failed: {0}")]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Seal(#[from] SealError),
}

impl CapabilityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPermissionId(_) => "MalformedPermissionId",
            Self::InvalidCapabilityObject => "InvalidCapabilityObject",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::UnknownOperation(_) => "UnknownOperation",
            Self::Tool(_) => "ToolExecutionFailed",
            Self::Seal(_) => "SealUnavailable",
        }
    }
}

fn join(ids: &[PermissionId]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(PermissionId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Issues capability objects for one catalog
pub struct Authority {
    seal: Arc<Seal>,
    catalog: Arc<CapabilityCatalog>,
}

impl Authority {
    /// Create an authority with a fresh seal
    pub fn new(catalog: Arc<CapabilityCatalog>) -> Result<Self, CapabilityError> {
        let seal = Arc::new(Seal::generate()?);
        debug!(authority = %seal.fingerprint(), tools = catalog.len(), "Authority created");
        Ok(Self { seal, catalog })
    }

    pub fn catalog(&self) -> &Arc<CapabilityCatalog> {
        &self.catalog
    }

    /// Log-safe identifier of this authority's seal
    pub fn fingerprint(&self) -> String {
        self.seal.fingerprint()
    }

    /// Issue a capability object holding exactly `ids`.
    ///
    /// Every id must be well formed; otherwise nothing is issued.
    pub fn grant<I, S>(&self, ids: I) -> Result<CapabilityObject, CapabilityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut granted = PermissionSet::new();
        for raw in ids {
            let id = PermissionId::new(raw.as_ref());
            if !id.is_well_formed() {
                return Err(CapabilityError::MalformedPermissionId(id.to_string()));
            }
            granted.insert(id);
        }

        let mut namespaces: BTreeMap<String, Namespace> = BTreeMap::new();
        for (namespace, action, handler) in self.catalog.entries() {
            namespaces
                .entry(namespace.to_string())
                .or_insert_with(|| Namespace {
                    name: namespace.to_string(),
                    actions: BTreeMap::new(),
                })
                .actions
                .insert(
                    action.to_string(),
                    GuardedAction {
                        id: PermissionId::from_parts(namespace, action),
                        issuer: Arc::clone(&self.seal),
                        handler: Arc::clone(handler),
                    },
                );
        }

        debug!(
            authority = %self.seal.fingerprint(),
            granted = %granted,
            "Capability object issued"
        );

        Ok(CapabilityObject {
            seal: Arc::clone(&self.seal),
            granted: Arc::new(granted),
            namespaces: Arc::new(namespaces),
        })
    }

    /// True iff `object` was issued by this authority
    pub fn verify(&self, object: &CapabilityObject) -> bool {
        self.seal.matches(&object.seal)
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("seal", &self.seal)
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// The runtime capability handle passed to untrusted code
#[derive(Clone)]
pub struct CapabilityObject {
    seal: Arc<Seal>,
    granted: Arc<PermissionSet>,
    namespaces: Arc<BTreeMap<String, Namespace>>,
}

impl CapabilityObject {
    /// Invoke `namespace.action`
    pub async fn call(
        &self,
        namespace: &str,
        action: &str,
        arguments: Value,
    ) -> Result<Value, CapabilityError> {
        match self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.actions.get(action))
        {
            Some(guarded) => guarded.invoke(self, arguments).await,
            None => {
                let id = PermissionId::from_parts(namespace, action);
                if self.granted.contains(&id) {
                    Err(CapabilityError::UnknownOperation(id))
                } else {
                    Err(self.denied(id))
                }
            }
        }
    }

    /// Invoke by full id
    pub async fn invoke(
        &self,
        id: &PermissionId,
        arguments: Value,
    ) -> Result<Value, CapabilityError> {
        let (namespace, action) = id
            .parts()
            .ok_or_else(|| CapabilityError::MalformedPermissionId(id.to_string()))?;
        self.call(namespace, action, arguments).await
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceRef<'_>> {
        self.namespaces.get(name).map(|namespace| NamespaceRef {
            holder: self,
            namespace,
        })
    }

    pub fn namespaces(&self) -> impl Iterator<Item = NamespaceRef<'_>> {
        self.namespaces.values().map(move |namespace| NamespaceRef {
            holder: self,
            namespace,
        })
    }

    pub fn list_granted(&self) -> Vec<PermissionId> {
        self.granted.to_vec()
    }

    pub fn granted(&self) -> &PermissionSet {
        &self.granted
    }

    pub fn has(&self, id: &str) -> bool {
        self.granted.contains_str(id)
    }

    fn denied(&self, id: PermissionId) -> CapabilityError {
        warn!(permission = %id, granted = %self.granted, "Capability call denied");
        CapabilityError::PermissionDenied {
            missing: vec![id],
            granted: self.granted.to_vec(),
        }
    }
}

impl std::fmt::Debug for CapabilityObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityObject")
            .field("authority", &self.seal.fingerprint())
            .field("granted", &self.granted.to_list_string())
            .finish()
    }
}

#[derive(Clone)]
struct Namespace {
    name: String,
    actions: BTreeMap<String, GuardedAction>,
}

/// A namespace of a capability object, e.g. `caps.namespace("fs")`
#[derive(Clone, Copy)]
pub struct NamespaceRef<'a> {
    holder: &'a CapabilityObject,
    namespace: &'a Namespace,
}

impl<'a> NamespaceRef<'a> {
    pub fn name(&self) -> &'a str {
        &self.namespace.name
    }

    /// Every action in the catalog for this namespace, granted or not
    pub fn actions(&self) -> impl Iterator<Item = &'a str> {
        self.namespace.actions.keys().map(String::as_str)
    }

    pub async fn call(&self, action: &str, arguments: Value) -> Result<Value, CapabilityError> {
        self.holder
            .call(&self.namespace.name, action, arguments)
            .await
    }
}

/// An action bound to the seal of the authority that issued it
#[derive(Clone)]
struct GuardedAction {
    id: PermissionId,
    issuer: Arc<Seal>,
    handler: Arc<dyn ToolHandler>,
}

impl GuardedAction {
    async fn invoke(
        &self,
        holder: &CapabilityObject,
        arguments: Value,
    ) -> Result<Value, CapabilityError> {
        if !self.issuer.matches(&holder.seal) {
            warn!(permission = %self.id, "Capability object seal mismatch");
            return Err(CapabilityError::InvalidCapabilityObject);
        }
        if !holder.granted.contains(&self.id) {
            return Err(holder.denied(self.id.clone()));
        }
        debug!(permission = %self.id, "Capability call");
        Ok(self.handler.call(arguments).await?)
    }
}
