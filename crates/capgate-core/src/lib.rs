//! capgate core - declarations, permission checks and capability objects
//!
//! This crate holds everything that does not need a second process: the
//! declaration scanner, the declared-vs-granted comparator, the tool catalog
//! and the authority that turns a grant into a capability object. The broker
//! and worker side live in `capgate-sandbox`.

pub mod authority;
pub mod catalog;
pub mod comparator;
pub mod config;
pub mod declaration;
pub mod mcp;
pub mod permission;
pub mod shell;
pub mod stubs;
pub mod tools;

pub use authority::{Authority, CapabilityError, CapabilityObject, NamespaceRef};
pub use catalog::{
    tool_fn, CapabilityCatalog, CatalogBuilder, CatalogError, ToolError, ToolHandler, ToolInfo,
};
pub use comparator::{check, PermissionCheck};
pub use config::{CapgateConfig, ConfigError, ExecutionConfig};
pub use declaration::{
    DeclarationFinding, DeclarationScanner, FindingStatus, Location, ScanError, ScanOutcome,
    ScanReport, ScannerConfig,
};
pub use mcp::{McpServer, McpServerConfig};
pub use permission::{PermissionError, PermissionId, PermissionSet};
pub use shell::ShellPolicy;

/// Declares the permissions a function needs.
///
/// In type position it names [`CapabilityObject`]; the declaration scanner
/// reads the literal ids.
///
/// ```
/// use capgate_core::Capabilities;
///
/// fn run(caps: Capabilities!["fs.read", "fs.write"]) -> bool {
///     caps.has("fs.read")
/// }
/// ```
#[macro_export]
macro_rules! Capabilities {
    ($($id:expr),* $(,)?) => {
        $crate::CapabilityObject
    };
}

/// Everything a declaring source unit imports
pub mod declare {
    pub use crate::Capabilities;
    pub use crate::{CapabilityError, CapabilityObject};
}
