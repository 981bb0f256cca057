//! Built-in tools
//!
//! The small set of operations capgate can mediate without an MCP server:
//! `fs.read`, `fs.write`, `fs.list`, `shell.exec` and `http.fetch`. Every tool
//! takes a JSON object and returns a JSON object.

use crate::catalog::{CatalogBuilder, CatalogError, ToolError, ToolHandler};
use crate::shell::{self, ShellConfig, ShellPolicy};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read and response bodies above this are truncated
pub const MAX_CONTENT_BYTES: usize = 256 * 1024;

/// Register every built-in tool
pub fn register_builtins(
    builder: &mut CatalogBuilder,
    shell: &ShellConfig,
) -> Result<(), CatalogError> {
    builder
        .register("fs.read", Arc::new(FsRead))?
        .register("fs.write", Arc::new(FsWrite))?
        .register("fs.list", Arc::new(FsList))?
        .register(
            "shell.exec",
            Arc::new(ShellExec {
                policy: ShellPolicy::from_config(shell),
            }),
        )?
        .register(
            "http.fetch",
            Arc::new(HttpFetch {
                client: reqwest::Client::new(),
            }),
        )?;
    Ok(())
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

pub struct FsRead;

#[async_trait]
impl ToolHandler for FsRead {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: PathArgs = parse_args(arguments)?;
        let bytes = tokio::fs::read(&args.path)
            .await
            .map_err(|e| ToolError::failed(format!("Error reading {}: {}", args.path, e)))?;
        let total = bytes.len();
        let (content, truncated) = shell::truncate_lossy(&bytes, MAX_CONTENT_BYTES);
        Ok(json!({
            "path": args.path,
            "content": content,
            "bytes": total,
            "truncated": truncated,
        }))
    }

    fn description(&self) -> Option<&str> {
        Some("Read a file as UTF-8 text")
    }
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

pub struct FsWrite;

#[async_trait]
impl ToolHandler for FsWrite {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        use tokio::io::AsyncWriteExt;

        let args: WriteArgs = parse_args(arguments)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(args.append)
            .truncate(!args.append)
            .open(&args.path)
            .await
            .map_err(|e| ToolError::failed(format!("Error opening {}: {}", args.path, e)))?;
        file.write_all(args.content.as_bytes())
            .await
            .map_err(|e| ToolError::failed(format!("Error writing {}: {}", args.path, e)))?;
        file.flush()
            .await
            .map_err(|e| ToolError::failed(format!("Error writing {}: {}", args.path, e)))?;
        Ok(json!({
            "path": args.path,
            "bytes_written": args.content.len(),
        }))
    }

    fn description(&self) -> Option<&str> {
        Some("Write or append text to a file")
    }
}

pub struct FsList;

#[async_trait]
impl ToolHandler for FsList {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: PathArgs = parse_args(arguments)?;
        let mut dir = tokio::fs::read_dir(&args.path)
            .await
            .map_err(|e| ToolError::failed(format!("Error listing {}: {}", args.path, e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ToolError::failed(format!("Error listing {}: {}", args.path, e)))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        entries.sort();

        let entries: Vec<Value> = entries
            .into_iter()
            .map(|(name, is_dir)| json!({ "name": name, "is_dir": is_dir }))
            .collect();
        Ok(json!({ "path": args.path, "entries": entries }))
    }

    fn description(&self) -> Option<&str> {
        Some("List a directory")
    }
}

#[derive(Deserialize)]
struct ShellArgs {
    command: String,
}

pub struct ShellExec {
    policy: ShellPolicy,
}

impl ShellExec {
    pub fn new(policy: ShellPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ToolHandler for ShellExec {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: ShellArgs = parse_args(arguments)?;
        let output = shell::execute_shell(&self.policy, &args.command)
            .await
            .map_err(|e| ToolError::failed(e.to_string()))?;
        serde_json::to_value(output).map_err(|e| ToolError::failed(e.to_string()))
    }

    fn description(&self) -> Option<&str> {
        Some("Run a shell command under the allowlist policy")
    }
}

#[derive(Deserialize)]
struct FetchArgs {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

pub struct HttpFetch {
    client: reqwest::Client,
}

#[async_trait]
impl ToolHandler for HttpFetch {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: FetchArgs = parse_args(arguments)?;
        if args.url.is_empty() {
            return Err(ToolError::InvalidArguments("No URL provided".to_string()));
        }

        let method = args.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let mut builder = match method.as_str() {
            "GET" => self.client.get(&args.url),
            "POST" => self.client.post(&args.url),
            "PUT" => self.client.put(&args.url),
            "DELETE" => self.client.delete(&args.url),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "Unsupported method '{}'",
                    other
                )))
            }
        };
        for (key, value) in &args.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = args.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ToolError::failed(format!("HTTP request failed: {}", e)))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::failed(format!("HTTP {} (body read error: {})", status, e)))?;
        let (body, truncated) = shell::truncate_lossy(&bytes, MAX_CONTENT_BYTES);

        Ok(json!({
            "url": args.url,
            "status": status,
            "body": body,
            "truncated": truncated,
        }))
    }

    fn description(&self) -> Option<&str> {
        Some("Make an HTTP request")
    }
}
