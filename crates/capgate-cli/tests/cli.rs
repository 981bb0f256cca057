//! The `capgate` binary end to end

#![cfg(unix)]

use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const DECLARES_READ: &str = r#"
    use capgate_core::declare::Capabilities;

    pub async fn main(caps: Capabilities!["fs.read"]) {
        let _ = caps;
    }
"#;

const FORGED: &str = r#"
    struct FakeCapabilities;
    fn main(caps: FakeCapabilities) {}
"#;

/// Workspace whose one MCP server leaves a marker file when started
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = json!({
            "execution": { "socket_dir": dir.path().join("sockets") },
            "mcp_servers": [{
                "name": "marker",
                "command": "sh",
                "args": ["-c", format!("touch {}", dir.path().join("mcp_started").display())],
            }],
        });
        std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();
        Self { dir }
    }

    fn source(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn mcp_started(&self) -> bool {
        self.dir.path().join("mcp_started").exists()
    }

    fn run(&self, source: &Path, grant: &str) -> Output {
        Command::new(env!("CARGO_BIN_EXE_capgate"))
            .arg("--config")
            .arg(self.dir.path().join("config.json"))
            .arg("run")
            .arg(source)
            .args(["--grant", grant, "--", "true"])
            .output()
            .unwrap()
    }
}

#[test]
fn test_forged_run_starts_no_mcp_server() {
    let workspace = Workspace::new();
    let source = workspace.source("forged.rs", FORGED);

    let output = workspace.run(&source, "fs.read");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("declaration rejected"));
    assert!(!workspace.mcp_started());
    assert!(!workspace.dir.path().join("sockets").exists());
}

#[test]
fn test_denied_run_starts_no_mcp_server() {
    let workspace = Workspace::new();
    let source = workspace.source("reader.rs", DECLARES_READ);

    let output = workspace.run(&source, "fs.write");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Missing:") && stderr.contains("Re-run with: --grant"));
    assert!(!workspace.mcp_started());
}

#[test]
fn test_granted_run_starts_mcp_servers() {
    let workspace = Workspace::new();
    let source = workspace.source("reader.rs", DECLARES_READ);

    let output = workspace.run(&source, "fs.read");

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(workspace.mcp_started());
}
