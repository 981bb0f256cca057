//! Sandbox error types

use capgate_core::{CapabilityError, DeclarationFinding, PermissionCheck, ScanError};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to bind broker socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Socket directory {path}: {message}")]
    SocketDir { path: PathBuf, message: String },

    #[error("Capability object was not issued by this session's authority")]
    ForeignCapabilityObject,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Capability declaration rejected: {}", describe(.findings))]
    DeclarationForgery { findings: Vec<DeclarationFinding> },

    #[error("Source declares no capabilities")]
    NoDeclaration,

    #[error("Permission denied: {}", summary(.0))]
    PermissionDenied(Box<PermissionCheck>),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker exceeded the {0:?} time limit")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeclarationForgery { .. } => "DeclarationForgery",
            Self::NoDeclaration => "NoDeclaration",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::Scan(_) => "ScanFailed",
            Self::Capability(e) => e.code(),
            Self::Broker(_) => "BrokerFailed",
            Self::Spawn(_) => "SpawnFailed",
            Self::Timeout(_) => "Timeout",
            Self::Io(_) => "IoError",
        }
    }
}

fn summary(check: &PermissionCheck) -> &str {
    &check.summary
}

fn describe(findings: &[DeclarationFinding]) -> String {
    findings
        .iter()
        .filter(|f| !f.valid)
        .map(|f| format!("{} at {}: {}", f.declared_type, f.location, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
