//! MCP client - Model Context Protocol servers as catalog backends
//!
//! JSON-RPC 2.0 over stdio. Each tool a server lists is registered in the
//! catalog as `server.tool`, so MCP tools are granted and brokered exactly
//! like the built-ins.

use crate::catalog::{CatalogBuilder, CatalogError, ToolError, ToolHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Invalid MCP server name '{0}': must be non-empty and contain no '.'")]
    InvalidName(String),

    #[error("Failed to spawn MCP server '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to MCP server: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP server closed its output")]
    Closed,

    #[error("Invalid JSON-RPC message: {0}")]
    Protocol(String),

    #[error("MCP error {code}: {message}")]
    Server { code: i64, message: String },
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

struct Transport {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl Transport {
    async fn send(&mut self, message: &impl Serialize) -> Result<(), McpError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| McpError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .await?;

        // Skip server notifications and anything not answering this request
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line).await? == 0 {
                return Err(McpError::Closed);
            }
            if line.trim().is_empty() {
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(e) => {
                    debug!(error = %e, "Ignoring non-response line from MCP server");
                    continue;
                }
            };
            if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                return Err(McpError::Server {
                    code: error.code,
                    message: error.message,
                });
            }
            return response
                .result
                .ok_or_else(|| McpError::Protocol("No result in response".to_string()));
        }
    }
}

/// One running MCP server process
pub struct McpServer {
    name: String,
    tools: Vec<McpTool>,
    transport: Mutex<Transport>,
    _process: Child,
}

impl McpServer {
    /// Spawn, initialize and list tools
    pub async fn connect(config: &McpServerConfig) -> Result<Arc<Self>, McpError> {
        if config.name.is_empty() || config.name.contains('.') {
            return Err(McpError::InvalidName(config.name.clone()));
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut process = cmd.spawn().map_err(|source| McpError::Spawn {
            name: config.name.clone(),
            source,
        })?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("Failed to get stdin".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("Failed to get stdout".to_string()))?;

        let mut transport = Transport {
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        };

        transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": {
                        "name": "capgate",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        transport
            .send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;

        let listed = transport.request("tools/list", None).await?;
        let tools: Vec<McpTool> = listed
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        info!(server = %config.name, tools = tools.len(), "MCP server connected");

        Ok(Arc::new(Self {
            name: config.name.clone(),
            tools,
            transport: Mutex::new(transport),
            _process: process,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    /// `tools/call`. The server's result object is returned as is; a result
    /// flagged `isError` becomes a tool failure.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, McpError> {
        let result = self
            .transport
            .lock()
            .await
            .request(
                "tools/call",
                Some(json!({ "name": tool, "arguments": arguments })),
            )
            .await?;
        Ok(result)
    }

    /// Register every listed tool as `server.tool`
    pub fn register(self: &Arc<Self>, builder: &mut CatalogBuilder) -> Result<(), CatalogError> {
        for tool in &self.tools {
            builder.register(
                &format!("{}.{}", self.name, tool.name),
                Arc::new(McpToolHandler {
                    server: Arc::clone(self),
                    tool: tool.name.clone(),
                    description: tool.description.clone(),
                }),
            )?;
        }
        Ok(())
    }
}

/// Connect every configured server. Servers that fail are logged and skipped.
pub async fn connect_all(configs: &[McpServerConfig]) -> Vec<Arc<McpServer>> {
    let mut servers = Vec::new();
    for config in configs {
        match McpServer::connect(config).await {
            Ok(server) => servers.push(server),
            Err(e) => warn!(server = %config.name, error = %e, "MCP server unavailable"),
        }
    }
    servers
}

struct McpToolHandler {
    server: Arc<McpServer>,
    tool: String,
    description: Option<String>,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let result = self
            .server
            .call_tool(&self.tool, arguments)
            .await
            .map_err(|e| ToolError::failed(e.to_string()))?;
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ToolError::failed(error_text(&result)));
        }
        Ok(result)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

fn error_text(result: &Value) -> String {
    let text: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|content| {
            content
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        "MCP tool reported an error".to_string()
    } else {
        text.join("\n")
    }
}
