pub mod transport;

use crate::error::{GatewayError, GatewayResult};
use crate::events::{self, EventSender, GatewayEvent};
use crate::rpc::{JsonRpcRequest, ToolCallParams, ToolCallResult, ToolDef, ToolsListResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transport::UpstreamTransport;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One entry in the upstream table: how to launch a back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamDescriptor {
    pub name: String,
    pub connected: bool,
    pub disabled: bool,
    pub tool_count: usize,
}

struct UpstreamEntry {
    config: UpstreamConfig,
    transport: Option<Arc<UpstreamTransport>>,
    tools: Vec<ToolDef>,
}

/// Canonical prefixed name: `<server>__<tool>`.
pub fn prefixed_tool_name(server: &str, tool: &str) -> String {
    format!("{}__{}", server, tool)
}

/// Split a prefixed name back into `(server, tool)`.
pub fn split_prefixed(name: &str) -> Option<(&str, &str)> {
    name.split_once("__")
}

/// Owns the upstream child processes and speaks line-delimited JSON-RPC
/// to them. Thread-safe; spawn/stop take the write lock, routing reads.
pub struct UpstreamPool {
    upstreams: RwLock<HashMap<String, UpstreamEntry>>,
    events: EventSender,
    request_timeout: Duration,
}

impl UpstreamPool {
    pub fn new(events: EventSender, request_timeout: Duration) -> Self {
        Self {
            upstreams: RwLock::new(HashMap::new()),
            events,
            request_timeout,
        }
    }

    pub async fn add_server(&self, name: &str, config: UpstreamConfig) {
        let mut map = self.upstreams.write().await;
        map.insert(
            name.to_string(),
            UpstreamEntry {
                config,
                transport: None,
                tools: Vec::new(),
            },
        );
    }

    pub async fn load_from_config(&self, table: &HashMap<String, UpstreamConfig>) {
        for (name, config) in table {
            self.add_server(name, config.clone()).await;
        }
    }

    pub async fn start_all(&self) -> usize {
        let names: Vec<String> = {
            let map = self.upstreams.read().await;
            map.keys().cloned().collect()
        };
        self.start_by_name(&names).await
    }

    /// Start the named upstreams (skipping disabled and already-running
    /// ones). Returns how many are connected afterwards.
    pub async fn start_by_name(&self, names: &[String]) -> usize {
        let mut started = 0;
        for name in names {
            match self.start_one(name).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to start upstream '{}': {}", name, e),
            }
        }
        started
    }

    async fn start_one(&self, name: &str) -> GatewayResult<bool> {
        let config = {
            let map = self.upstreams.read().await;
            let entry = map.get(name).ok_or_else(|| {
                GatewayError::Internal(format!("unknown upstream '{}'", name))
            })?;
            if entry.config.disabled {
                return Ok(false);
            }
            if entry
                .transport
                .as_ref()
                .map(|t| t.is_connected())
                .unwrap_or(false)
            {
                return Ok(false);
            }
            entry.config.clone()
        };

        let events = self.events.clone();
        let server = name.to_string();
        let transport = UpstreamTransport::spawn(
            name,
            &config.command,
            &config.args,
            &config.env,
            config.cwd.as_ref(),
            move |code| {
                events::emit(&events, GatewayEvent::UpstreamExited { server, code });
            },
        )
        .await?;
        let transport = Arc::new(transport);

        self.handshake(name, &transport).await?;
        let tools = self.fetch_tools(name, &transport).await?;
        info!("Upstream '{}' connected with {} tools", name, tools.len());

        {
            let mut map = self.upstreams.write().await;
            if let Some(entry) = map.get_mut(name) {
                entry.transport = Some(Arc::clone(&transport));
                entry.tools = tools;
            }
        }
        events::emit(
            &self.events,
            GatewayEvent::UpstreamStarted {
                server: name.to_string(),
            },
        );
        Ok(true)
    }

    async fn handshake(&self, name: &str, transport: &UpstreamTransport) -> GatewayResult<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let req = JsonRpcRequest::new(transport.next_id(), "initialize", Some(params));
        let resp = transport
            .send_request(req, self.request_timeout, &CancellationToken::new())
            .await?;
        if let Some(err) = resp.error {
            transport.shutdown().await;
            return Err(GatewayError::Upstream {
                code: err.code,
                message: format!("initialize failed for '{}': {}", name, err.message),
            });
        }
        transport
            .send_notification("notifications/initialized", None)
            .await?;
        Ok(())
    }

    async fn fetch_tools(
        &self,
        name: &str,
        transport: &UpstreamTransport,
    ) -> GatewayResult<Vec<ToolDef>> {
        let req = JsonRpcRequest::new(transport.next_id(), "tools/list", None);
        let resp = transport
            .send_request(req, self.request_timeout, &CancellationToken::new())
            .await?;
        if let Some(err) = resp.error {
            // A server with no tool surface is usable, just empty.
            if err.code == crate::rpc::codes::METHOD_NOT_FOUND {
                info!("Upstream '{}' exposes no tools", name);
                return Ok(Vec::new());
            }
            return Err(GatewayError::Upstream {
                code: err.code,
                message: err.message,
            });
        }
        let result = resp.result.unwrap_or(Value::Null);
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::Internal(format!("bad tools/list from '{}': {}", name, e)))?;
        Ok(list.tools)
    }

    /// Re-run discovery against every connected upstream.
    pub async fn refresh_tools(&self) {
        let connected: Vec<(String, Arc<UpstreamTransport>)> = {
            let map = self.upstreams.read().await;
            map.iter()
                .filter_map(|(name, e)| {
                    e.transport
                        .as_ref()
                        .filter(|t| t.is_connected())
                        .map(|t| (name.clone(), Arc::clone(t)))
                })
                .collect()
        };
        for (name, transport) in connected {
            match self.fetch_tools(&name, &transport).await {
                Ok(tools) => {
                    let mut map = self.upstreams.write().await;
                    if let Some(entry) = map.get_mut(&name) {
                        entry.tools = tools;
                    }
                }
                Err(e) => warn!("Tool refresh failed for '{}': {}", name, e),
            }
        }
    }

    pub async fn stop_all(&self) {
        let mut map = self.upstreams.write().await;
        for (name, entry) in map.iter_mut() {
            if let Some(transport) = entry.transport.take() {
                info!("Stopping upstream '{}'", name);
                transport.shutdown().await;
            }
            entry.tools.clear();
        }
    }

    /// Forward an arbitrary request to a named upstream and return its
    /// result value. Upstream error envelopes become `Upstream` errors.
    pub async fn route_to_server(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Value> {
        let transport = self.transport_of(name).await?;
        let req = JsonRpcRequest::new(transport.next_id(), method, params);
        let resp = transport
            .send_request(req, self.request_timeout, cancel)
            .await?;
        if let Some(err) = resp.error {
            return Err(GatewayError::Upstream {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Route by prefixed tool name: `tools/call` for `<server>__<tool>`
    /// goes to `<server>` with the bare tool name.
    #[allow(dead_code)]
    pub async fn route_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Value> {
        if method != "tools/call" {
            return Err(GatewayError::Internal(format!(
                "pool cannot route method '{}'",
                method
            )));
        }
        let call: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| GatewayError::Internal(format!("bad tools/call params: {}", e)))?;
        let (server, tool) = split_prefixed(&call.name).ok_or_else(|| {
            GatewayError::Internal(format!("tool '{}' has no server prefix", call.name))
        })?;
        let result = self.call_tool(server, tool, call.arguments, cancel).await?;
        serde_json::to_value(result)
            .map_err(|e| GatewayError::Internal(format!("serialize tool result: {}", e)))
    }

    /// Invoke a bare tool name on a specific upstream.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> GatewayResult<ToolCallResult> {
        let params = serde_json::to_value(ToolCallParams {
            name: tool.to_string(),
            arguments,
        })
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let result = self
            .route_to_server(server, "tools/call", Some(params), cancel)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::Internal(format!("bad tool result from '{}': {}", server, e)))
    }

    pub async fn list_upstreams(&self) -> Vec<UpstreamDescriptor> {
        let map = self.upstreams.read().await;
        let mut list: Vec<UpstreamDescriptor> = map
            .iter()
            .map(|(name, e)| UpstreamDescriptor {
                name: name.clone(),
                connected: e.transport.as_ref().map(|t| t.is_connected()).unwrap_or(false),
                disabled: e.config.disabled,
                tool_count: e.tools.len(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    #[allow(dead_code)]
    pub async fn is_connected(&self, name: &str) -> bool {
        let map = self.upstreams.read().await;
        map.get(name)
            .and_then(|e| e.transport.as_ref())
            .map(|t| t.is_connected())
            .unwrap_or(false)
    }

    /// Every discovered tool as `(server, def)` pairs.
    pub async fn all_tools(&self) -> Vec<(String, ToolDef)> {
        let map = self.upstreams.read().await;
        let mut tools: Vec<(String, ToolDef)> = map
            .iter()
            .filter(|(_, e)| e.transport.as_ref().map(|t| t.is_connected()).unwrap_or(false))
            .flat_map(|(name, e)| e.tools.iter().map(move |t| (name.clone(), t.clone())))
            .collect();
        tools.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        tools
    }

    pub async fn server_names(&self) -> Vec<String> {
        let map = self.upstreams.read().await;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    async fn transport_of(&self, name: &str) -> GatewayResult<Arc<UpstreamTransport>> {
        let map = self.upstreams.read().await;
        let entry = map
            .get(name)
            .ok_or_else(|| GatewayError::Internal(format!("unknown upstream '{}'", name)))?;
        match &entry.transport {
            Some(t) if t.is_connected() => Ok(Arc::clone(t)),
            _ => Err(GatewayError::UpstreamClosed {
                server: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal tool server speaking the line-delimited dialect:
    // initialize, tools/list with one "echo" tool, tools/call echoing
    // its arguments back.
    const TOOL_SERVER: &str = r#"
import sys, json

def reply(id, result):
    sys.stdout.write(json.dumps({"jsonrpc": "2.0", "id": id, "result": result}) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    method = req.get("method")
    if "id" not in req:
        continue
    if method == "initialize":
        reply(req["id"], {"protocolVersion": "2024-11-05", "serverInfo": {"name": "test"}})
    elif method == "tools/list":
        reply(req["id"], {"tools": [{"name": "echo", "description": "Echo", "inputSchema": {"type": "object"}}]})
    elif method == "tools/call":
        args = req.get("params", {}).get("arguments", {})
        reply(req["id"], {"content": [{"type": "text", "text": json.dumps(args)}], "isError": False})
    else:
        sys.stdout.write(json.dumps({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32601, "message": "Method not found"}}) + "\n")
        sys.stdout.flush()
"#;

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            command: "python3".into(),
            args: vec!["-c".into(), TOOL_SERVER.into()],
            env: HashMap::new(),
            cwd: None,
            disabled: false,
        }
    }

    fn pool() -> UpstreamPool {
        let (tx, _rx) = events::channel();
        UpstreamPool::new(tx, Duration::from_secs(5))
    }

    #[test]
    fn prefixing_roundtrip() {
        assert_eq!(prefixed_tool_name("fs", "read"), "fs__read");
        assert_eq!(split_prefixed("fs__read"), Some(("fs", "read")));
        // First separator wins; the rest belongs to the tool.
        assert_eq!(split_prefixed("fs__read__v2"), Some(("fs", "read__v2")));
        assert_eq!(split_prefixed("noprefix"), None);
    }

    #[tokio::test]
    async fn start_discovers_tools_and_calls_them() {
        let pool = pool();
        pool.add_server("test", test_config()).await;
        assert_eq!(pool.start_all().await, 1);
        assert!(pool.is_connected("test").await);

        let tools = pool.all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "test");
        assert_eq!(tools[0].1.name, "echo");

        let result = pool
            .call_tool(
                "test",
                "echo",
                serde_json::json!({"msg": "hi"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        match &result.content[0] {
            crate::rpc::ContentBlock::Text { text } => assert!(text.contains("hi")),
            other => panic!("unexpected content {:?}", other),
        }
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn route_request_splits_prefixed_names() {
        let pool = pool();
        pool.add_server("test", test_config()).await;
        pool.start_all().await;

        let value = pool
            .route_request(
                "tools/call",
                Some(serde_json::json!({"name": "test__echo", "arguments": {"n": 1}})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(value["isError"], false);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_upstreams_are_skipped() {
        let pool = pool();
        let mut config = test_config();
        config.disabled = true;
        pool.add_server("off", config).await;
        assert_eq!(pool.start_all().await, 0);
        assert!(!pool.is_connected("off").await);

        let list = pool.list_upstreams().await;
        assert_eq!(list.len(), 1);
        assert!(list[0].disabled);
        assert!(!list[0].connected);
    }

    #[tokio::test]
    async fn routing_to_stopped_upstream_fails_cleanly() {
        let pool = pool();
        pool.add_server("test", test_config()).await;
        pool.start_all().await;
        pool.stop_all().await;

        let err = pool
            .call_tool("test", "echo", Value::Null, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamClosed { .. }));
    }

    #[tokio::test]
    async fn upstream_errors_propagate() {
        let pool = pool();
        pool.add_server("test", test_config()).await;
        pool.start_all().await;

        let err = pool
            .route_to_server("test", "prompts/get", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { code: -32601, .. }));
        pool.stop_all().await;
    }
}
