//! Shell execution policy - allowlist model
//!
//! A blocklist ("block rm -rf /") is useless: an attacker just uses
//! `find / -delete` or `perl -e 'system("rm -rf /")'`.
//!
//! Only explicitly permitted commands can execute. Every segment of a
//! pipeline or command list is checked, not just the first word.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// Commands allowed when the configuration names none
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // read-only
    "ls", "cat", "head", "tail", "wc", "find", "grep", "rg", "echo", "date", "pwd", "whoami",
    "uname", "which", "file", "stat", "du", "df", "tree", "sort", "uniq", "cut", "awk", "sed",
    "tr", "diff", "hexdump", "xxd", "jq", "true", "false",
    // writes
    "mkdir", "cp", "mv", "touch", "tee",
    // toolchains
    "git", "cargo", "rustc", "make", "python3", "node",
    // archives
    "tar", "zip", "unzip", "gzip", "gunzip",
];

/// Shell settings from the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    /// Replaces the default allowlist when set
    pub allowed_commands: Option<Vec<String>>,
    pub max_output_bytes: usize,
    pub timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            allowed_commands: None,
            max_output_bytes: 64 * 1024,
            timeout_secs: 30,
        }
    }
}

/// Shell execution policy
#[derive(Debug, Clone)]
pub struct ShellPolicy {
    allowed: BTreeSet<String>,
    /// Maximum output size in bytes before truncation
    pub max_output_bytes: usize,
    pub timeout: Duration,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self::from_config(&ShellConfig::default())
    }
}

impl ShellPolicy {
    /// A policy that allows nothing
    pub fn empty() -> Self {
        let defaults = ShellConfig::default();
        Self {
            allowed: BTreeSet::new(),
            max_output_bytes: defaults.max_output_bytes,
            timeout: Duration::from_secs(defaults.timeout_secs),
        }
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        let allowed = match &config.allowed_commands {
            Some(commands) => commands.iter().cloned().collect(),
            None => DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        };
        Self {
            allowed,
            max_output_bytes: config.max_output_bytes,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn allow(&mut self, cmd: &str) {
        self.allowed.insert(cmd.to_string());
    }

    pub fn deny(&mut self, cmd: &str) {
        self.allowed.remove(cmd);
    }

    pub fn allowed_commands(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Check whether a command line may run
    pub fn check(&self, command: &str) -> Result<(), ShellDenied> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(ShellDenied::Empty);
        }

        // Substitution can run anything, wherever it appears
        if trimmed.contains("$(") || trimmed.contains('`') {
            return Err(ShellDenied::SubshellBlocked);
        }

        if ["/dev/", "/etc/", "/sys/"].iter().any(|dir| {
            trimmed.contains(&format!("> {}", dir)) || trimmed.contains(&format!(">{}", dir))
        }) {
            return Err(ShellDenied::DangerousRedirect);
        }

        // `|`, `||`, `&&`, `&` and `;` all start a new command
        for segment in trimmed.split(['|', '&', ';']) {
            let Some(cmd) = segment.split_whitespace().next() else {
                continue;
            };
            if !self.is_allowed(cmd) {
                return Err(ShellDenied::NotAllowed(cmd.to_string()));
            }
        }
        Ok(())
    }

    fn is_allowed(&self, cmd: &str) -> bool {
        // /usr/bin/ls -> ls
        let basename = cmd.rsplit('/').next().unwrap_or(cmd);
        self.allowed.contains(basename)
    }
}

/// Reasons a shell command can be denied or fail
#[derive(Debug, thiserror::Error)]
pub enum ShellDenied {
    #[error("Empty command")]
    Empty,
    #[error("Command not in allowlist: {0}")]
    NotAllowed(String),
    #[error("Subshell execution ($() or backticks) not allowed")]
    SubshellBlocked,
    #[error("Redirect to sensitive path blocked")]
    DangerousRedirect,
    #[error("Failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured result of a shell command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// Execute a shell command under the given policy
pub async fn execute_shell(policy: &ShellPolicy, command: &str) -> Result<ShellOutput, ShellDenied> {
    if let Err(denied) = policy.check(command) {
        warn!(command, reason = %denied, "Shell command denied");
        return Err(denied);
    }
    debug!(command, "Running shell command");

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ShellDenied::Spawn)?;

    let output = tokio::time::timeout(policy.timeout, child.wait_with_output())
        .await
        .map_err(|_| ShellDenied::Timeout(policy.timeout))?
        .map_err(ShellDenied::Spawn)?;

    let (stdout, out_cut) = truncate_lossy(&output.stdout, policy.max_output_bytes);
    let (stderr, err_cut) = truncate_lossy(&output.stderr, policy.max_output_bytes);

    Ok(ShellOutput {
        exit_code: output.status.code(),
        stdout,
        stderr,
        truncated: out_cut || err_cut,
    })
}

/// Decode as UTF-8 (lossy) and cut at a char boundary at or below `max`
pub(crate) fn truncate_lossy(bytes: &[u8], max: usize) -> (String, bool) {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= max {
        return (text, false);
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, true)
}
