//! Static capability declaration scanning
//!
//! A source unit states which operations it needs by annotating a parameter
//! or binding with a capability marker:
//!
//! ```rust,ignore
//! use capgate_core::Capabilities;
//!
//! async fn run(caps: Capabilities!["fs.read", "fs.write"]) { /* ... */ }
//! ```
//!
//! The scanner walks every function parameter, closure parameter and `let`
//! annotation, decides where each marker type comes from, and extracts the
//! literal permission ids of trusted declarations. A locally redefined marker
//! is a forgery unless its alias chain bottoms out at a trusted base, in which
//! case it is accepted with a warning.
//!
//! This is a heuristic against a cooperative front-end. It is not a security
//! boundary: the broker re-checks every request against the grant no matter
//! what this scan concluded.

mod literals;
mod symbols;

use crate::permission::{PermissionId, PermissionSet};
use literals::TypeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use symbols::{Origin, SymbolTable};
use syn::visit::Visit;
use syn::{PatType, Type};
use thiserror::Error;
use tracing::{debug, warn};

/// Default suffix that marks a type as a capability declaration
pub const DEFAULT_MARKER_SUFFIX: &str = "Capabilities";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scanner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    /// Type names ending in this suffix are capability markers
    pub marker_suffix: String,
    /// Module paths markers may be imported from
    pub trusted_modules: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            marker_suffix: DEFAULT_MARKER_SUFFIX.to_string(),
            trusted_modules: vec![
                "capgate_core".to_string(),
                "capgate_core::declare".to_string(),
            ],
        }
    }
}

/// Line (1-based) and column (1-based) of a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingStatus {
    /// Imported from a trusted module
    Trusted,
    /// Local alias that resolves to a trusted base. Accepted, but a local
    /// redefinition should never be needed.
    AliasWarning,
    /// Locally defined or unresolvable marker
    Forgery,
    /// Imported from a module outside the allow-list
    Untrusted,
}

impl FindingStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Trusted | Self::AliasWarning)
    }
}

/// One discovered declaration and the verdict on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclarationFinding {
    pub location: Location,
    pub declared_type: String,
    /// Extracted ids; always empty for rejected declarations
    pub permissions: Vec<PermissionId>,
    pub valid: bool,
    pub status: FindingStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanOutcome {
    /// At least one declaration, all of them valid
    Accepted,
    /// At least one declaration was rejected
    Rejected,
    /// Nothing declared. Callers decide what that means.
    NoDeclarations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub findings: Vec<DeclarationFinding>,
    /// Union of ids across valid findings
    pub permissions: PermissionSet,
}

impl ScanReport {
    pub fn outcome(&self) -> ScanOutcome {
        if self.findings.is_empty() {
            ScanOutcome::NoDeclarations
        } else if self.findings.iter().all(|f| f.valid) {
            ScanOutcome::Accepted
        } else {
            ScanOutcome::Rejected
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome() == ScanOutcome::Accepted
    }

    pub fn rejected(&self) -> impl Iterator<Item = &DeclarationFinding> {
        self.findings.iter().filter(|f| !f.valid)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DeclarationFinding> {
        self.findings
            .iter()
            .filter(|f| f.status == FindingStatus::AliasWarning)
    }
}

/// Scans source units for capability declarations
#[derive(Debug, Clone, Default)]
pub struct DeclarationScanner {
    config: ScannerConfig,
}

impl DeclarationScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn scan_file(&self, path: &Path) -> Result<ScanReport, ScanError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.scan(&source)
    }

    pub fn scan(&self, source: &str) -> Result<ScanReport, ScanError> {
        let file = syn::parse_file(source).map_err(|e| {
            let start = e.span().start();
            ScanError::Parse {
                line: start.line,
                column: start.column + 1,
                message: e.to_string(),
            }
        })?;

        let symbols = SymbolTable::collect(&file);
        let mut visitor = DeclarationVisitor {
            scanner: self,
            symbols: &symbols,
            findings: Vec::new(),
        };
        visitor.visit_file(&file);

        let mut findings = visitor.findings;
        findings.sort_by_key(|f| f.location);

        let permissions = findings
            .iter()
            .filter(|f| f.valid)
            .flat_map(|f| f.permissions.iter().cloned())
            .collect();

        for finding in &findings {
            if finding.valid {
                debug!(
                    location = %finding.location,
                    declared_type = %finding.declared_type,
                    permissions = finding.permissions.len(),
                    "Capability declaration accepted"
                );
            } else {
                warn!(
                    location = %finding.location,
                    declared_type = %finding.declared_type,
                    reason = %finding.reason,
                    "Capability declaration rejected"
                );
            }
        }

        Ok(ScanReport {
            findings,
            permissions,
        })
    }

    fn is_marker(&self, name: &str) -> bool {
        name.ends_with(&self.config.marker_suffix)
    }

    /// Is the annotation a marker, either by its own name or by the name of
    /// the item it was imported as
    fn names_marker(&self, symbols: &SymbolTable, reference: &TypeRef<'_>) -> bool {
        let name = reference.name();
        if self.is_marker(name) {
            return true;
        }
        reference.segments.len() == 1
            && symbols
                .import(name)
                .is_some_and(|import| self.is_marker(&import.original))
    }

    fn origin<'s>(&self, symbols: &'s SymbolTable, segments: &[String]) -> Origin<'s> {
        symbols.origin(segments, &self.config.trusted_modules, |name| {
            self.is_marker(name)
        })
    }

    fn evaluate(&self, symbols: &SymbolTable, reference: &TypeRef<'_>) -> Verdict {
        let site_literals = reference.literals();
        match self.origin(symbols, &reference.segments) {
            Origin::Trusted { module, original } => Verdict::accept(
                FindingStatus::Trusted,
                site_literals.unwrap_or_default(),
                format!("`{}` imported from trusted module `{}`", original, module),
            ),
            Origin::Alias { name, ty } => match self.resolve_alias(symbols, &name, ty) {
                Ok(base) => Verdict::accept(
                    FindingStatus::AliasWarning,
                    site_literals.or(base.literals).unwrap_or_default(),
                    format!(
                        "local alias chain {} resolves to `{}` from `{}`; import the trusted type directly",
                        base.chain.join(" -> "),
                        base.name,
                        base.module
                    ),
                ),
                Err(reason) => Verdict::reject(FindingStatus::Forgery, reason),
            },
            Origin::TrustedNonMarker { module, original } => Verdict::reject(
                FindingStatus::Forgery,
                format!("`{}` from `{}` is not a capability type", original, module),
            ),
            Origin::Foreign { module } => Verdict::reject(
                FindingStatus::Untrusted,
                format!("imported from untrusted module `{}`", module),
            ),
            Origin::LocalItem => Verdict::reject(
                FindingStatus::Forgery,
                format!(
                    "`{}` is defined locally instead of imported from a trusted module",
                    reference.name()
                ),
            ),
            Origin::AmbiguousGlob => Verdict::reject(
                FindingStatus::Untrusted,
                format!(
                    "`{}` may come from an untrusted glob import",
                    reference.name()
                ),
            ),
            Origin::Unknown => Verdict::reject(
                FindingStatus::Forgery,
                format!("`{}` is neither imported nor defined", reference.display()),
            ),
        }
    }

    /// Follow a local alias chain until it reaches a trusted base or dead-ends.
    /// Every alias is visited at most once, so cycles terminate.
    fn resolve_alias(
        &self,
        symbols: &SymbolTable,
        name: &str,
        ty: &Type,
    ) -> Result<AliasBase, String> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(name.to_string());
        let mut chain = vec![name.to_string()];
        let mut literals: Option<Vec<String>> = None;
        let mut current = ty;

        loop {
            let Some(reference) = TypeRef::from_type(current) else {
                return Err(format!(
                    "alias `{}` does not name a type; not derived from a trusted capability type",
                    chain.last().map(String::as_str).unwrap_or(name)
                ));
            };
            if literals.is_none() {
                literals = reference.literals();
            }

            match self.origin(symbols, &reference.segments) {
                Origin::Trusted { module, original } => {
                    chain.push(original.clone());
                    return Ok(AliasBase {
                        module,
                        name: original,
                        chain,
                        literals,
                    });
                }
                Origin::Alias { name: next, ty } => {
                    if !visited.insert(next.clone()) {
                        chain.push(next);
                        return Err(format!(
                            "alias chain {} is cyclic and never reaches a trusted capability type",
                            chain.join(" -> ")
                        ));
                    }
                    chain.push(next);
                    current = ty;
                }
                _ => {
                    chain.push(reference.display());
                    return Err(format!(
                        "alias chain {} is not derived from a trusted capability type",
                        chain.join(" -> ")
                    ));
                }
            }
        }
    }
}

/// Scan with the default configuration
pub fn scan(source: &str) -> Result<ScanReport, ScanError> {
    DeclarationScanner::default().scan(source)
}

struct AliasBase {
    module: String,
    name: String,
    chain: Vec<String>,
    literals: Option<Vec<String>>,
}

struct Verdict {
    status: FindingStatus,
    permissions: Vec<PermissionId>,
    reason: String,
}

impl Verdict {
    fn accept(status: FindingStatus, literals: Vec<String>, reason: String) -> Self {
        let mut seen = HashSet::new();
        let permissions = literals
            .into_iter()
            .filter(|raw| seen.insert(raw.clone()))
            .map(PermissionId::new)
            .collect();
        Self {
            status,
            permissions,
            reason,
        }
    }

    fn reject(status: FindingStatus, reason: String) -> Self {
        Self {
            status,
            permissions: Vec::new(),
            reason,
        }
    }
}

struct DeclarationVisitor<'a> {
    scanner: &'a DeclarationScanner,
    symbols: &'a SymbolTable,
    findings: Vec<DeclarationFinding>,
}

impl<'ast> Visit<'ast> for DeclarationVisitor<'_> {
    fn visit_pat_type(&mut self, node: &'ast PatType) {
        if let Some(reference) = TypeRef::from_type(&node.ty) {
            if self.scanner.names_marker(self.symbols, &reference) {
                let verdict = self.scanner.evaluate(self.symbols, &reference);
                let start = reference.span.start();
                self.findings.push(DeclarationFinding {
                    location: Location {
                        line: start.line,
                        column: start.column + 1,
                    },
                    declared_type: reference.display(),
                    permissions: verdict.permissions,
                    valid: verdict.status.is_valid(),
                    status: verdict.status,
                    reason: verdict.reason,
                });
            }
        }
        syn::visit::visit_pat_type(self, node);
    }
}
