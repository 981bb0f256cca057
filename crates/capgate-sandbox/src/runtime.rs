//! Execution supervisor
//!
//! Ties the pieces together for one run of an untrusted source unit:
//! scan, compare against the grant, and only then issue capabilities, bind a
//! broker and start the worker. The broker is closed on every exit path.

use crate::broker::{Broker, BrokerConfig};
use crate::client::WorkerEnv;
use crate::error::SandboxError;
use capgate_core::{
    check, Authority, CapabilityCatalog, CapgateConfig, DeclarationScanner, ExecutionConfig,
    PermissionCheck, PermissionSet, ScanOutcome, ScanReport,
};
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Worker shares the supervisor's stdio
    #[default]
    Inherit,
    /// stdout and stderr are collected into the outcome
    Capture,
}

/// The process that runs the untrusted code
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    output: OutputMode,
}

impl WorkerCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            output: OutputMode::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    /// `None` when the worker was killed by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Empty unless output was captured
    pub stdout: String,
    pub stderr: String,
}

/// Result of the side-effect-free checks
#[derive(Debug, Clone)]
pub struct Preflight {
    pub report: ScanReport,
    pub check: PermissionCheck,
}

pub struct Execution {
    catalog: Arc<CapabilityCatalog>,
    scanner: DeclarationScanner,
    config: ExecutionConfig,
}

impl Execution {
    pub fn new(
        catalog: Arc<CapabilityCatalog>,
        scanner: DeclarationScanner,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            catalog,
            scanner,
            config,
        }
    }

    pub fn from_config(catalog: Arc<CapabilityCatalog>, config: &CapgateConfig) -> Self {
        Self::new(
            catalog,
            DeclarationScanner::new(config.scanner.clone()),
            config.execution.clone(),
        )
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Scan and compare. Creates nothing and spawns nothing.
    pub fn preflight(&self, source: &str, grant: &PermissionSet) -> Result<Preflight, SandboxError> {
        let report = self.scanner.scan(source)?;

        let declared = match report.outcome() {
            ScanOutcome::Accepted => report.permissions.clone(),
            ScanOutcome::Rejected => {
                return Err(SandboxError::DeclarationForgery {
                    findings: report.findings,
                })
            }
            ScanOutcome::NoDeclarations if self.config.allow_undeclared => {
                debug!("No declarations; running with an empty declared set");
                PermissionSet::new()
            }
            ScanOutcome::NoDeclarations => return Err(SandboxError::NoDeclaration),
        };

        let check = check(&declared, grant);
        if !check.allowed {
            warn!(missing = ?check.missing, "Grant does not cover declared permissions");
            return Err(SandboxError::PermissionDenied(Box::new(check)));
        }
        Ok(Preflight { report, check })
    }

    /// Preflight, then run the worker against a fresh broker
    pub async fn run(
        &self,
        source: &str,
        grant: &PermissionSet,
        worker: WorkerCommand,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.preflight(source, grant)?;

        let authority = Authority::new(Arc::clone(&self.catalog))?;
        let capabilities = authority.grant(grant)?;
        let broker = Broker::bind(&BrokerConfig::from(&self.config), &authority, capabilities)?;

        let env = WorkerEnv {
            socket: broker.socket_path().to_path_buf(),
            catalog: self.catalog.ids(),
            granted: grant.clone(),
            call_timeout: self.config.call_timeout(),
        };
        let result = self.supervise(&env, worker).await;
        broker.close().await;
        result
    }

    async fn supervise(
        &self,
        env: &WorkerEnv,
        worker: WorkerCommand,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .envs(worker.env.iter().map(|(k, v)| (k, v)))
            .envs(env.vars())
            .kill_on_drop(true);
        if let Some(dir) = &worker.current_dir {
            cmd.current_dir(dir);
        }
        if worker.output == OutputMode::Capture {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        info!(
            worker = ?worker.program,
            pid = ?child.id(),
            socket = %env.socket.display(),
            "Worker spawned"
        );

        let limit = self.config.timeout();
        let outcome = match worker.output {
            OutputMode::Capture => {
                // Dropping the future on timeout drops the child, which kills it
                match tokio::time::timeout(limit, child.wait_with_output()).await {
                    Ok(output) => {
                        let output = output?;
                        ExecutionOutcome {
                            exit_code: output.status.code(),
                            success: output.status.success(),
                            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        }
                    }
                    Err(_) => {
                        warn!(timeout = ?limit, "Worker timed out; killed");
                        return Err(SandboxError::Timeout(limit));
                    }
                }
            }
            OutputMode::Inherit => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    ExecutionOutcome {
                        exit_code: status.code(),
                        success: status.success(),
                        stdout: String::new(),
                        stderr: String::new(),
                    }
                }
                Err(_) => {
                    warn!(timeout = ?limit, "Worker timed out; killing");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill worker");
                    }
                    return Err(SandboxError::Timeout(limit));
                }
            },
        };

        info!(exit_code = ?outcome.exit_code, "Worker exited");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate_core::{tool_fn, CatalogBuilder, ScannerConfig};

    fn execution(allow_undeclared: bool) -> Execution {
        let mut builder = CatalogBuilder::new();
        for id in ["fs.read", "fs.write"] {
            builder
                .register(id, tool_fn(|args| async move { Ok(args) }))
                .unwrap();
        }
        Execution::new(
            Arc::new(builder.build()),
            DeclarationScanner::new(ScannerConfig::default()),
            ExecutionConfig {
                allow_undeclared,
                ..ExecutionConfig::default()
            },
        )
    }

    const DECLARES_READ: &str = r#"
        use capgate_core::Capabilities;
        async fn main(caps: Capabilities!["fs.read"]) {}
    "#;

    #[test]
    fn test_preflight_accepts_covering_grant() {
        let grant = PermissionSet::parse_list("fs.read,fs.write").unwrap();
        let preflight = execution(false).preflight(DECLARES_READ, &grant).unwrap();
        assert!(preflight.check.allowed);
        assert_eq!(preflight.check.extra.len(), 1);
    }

    #[test]
    fn test_preflight_denies_narrow_grant() {
        let source = r#"
            use capgate_core::Capabilities;
            async fn main(caps: Capabilities!["fs.read", "fs.write"]) {}
        "#;
        let grant = PermissionSet::parse_list("fs.read").unwrap();
        match execution(false).preflight(source, &grant) {
            Err(SandboxError::PermissionDenied(check)) => {
                assert_eq!(check.missing.len(), 1);
                assert_eq!(check.suggested_grant_arg().as_deref(), Some("fs.read,fs.write"));
            }
            other => panic!("expected denial, got {:?}", other.map(|p| p.check)),
        }
    }

    #[test]
    fn test_preflight_rejects_forgery() {
        let source = r#"
            struct FakeCapabilities;
            fn main(caps: FakeCapabilities) {}
        "#;
        let err = execution(false)
            .preflight(source, &PermissionSet::new())
            .unwrap_err();
        assert_eq!(err.code(), "DeclarationForgery");
        assert!(err.to_string().contains("FakeCapabilities"));
    }

    #[test]
    fn test_undeclared_policy() {
        let source = "fn main() {}";
        assert!(matches!(
            execution(false).preflight(source, &PermissionSet::new()),
            Err(SandboxError::NoDeclaration)
        ));
        let preflight = execution(true)
            .preflight(source, &PermissionSet::new())
            .unwrap();
        assert!(preflight.check.allowed);
    }
}
