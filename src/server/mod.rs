// North-bound stdio server: line-delimited JSON-RPC 2.0 on the
// gateway's own standard streams. The client performs the initialize
// handshake (optionally declaring skills, which drives identity
// resolution), then issues tools/list and tools/call. Tool-visibility
// changes are pushed as notifications/tools/list_changed, always after
// the response that caused them.

use crate::config::Config;
use crate::error::GatewayError;
use crate::identity::{AgentIdentity, SkillDeclaration};
use crate::router::{RouterCore, SetRoleOptions};
use crate::rpc::{
    codes, InitializeParams, JsonRpcRequest, JsonRpcResponse, NOTIFY_TOOLS_CHANGED,
};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn serve_stdio(router: Arc<RouterCore>, config: &Config) -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    serve(router, config, stdin, stdout).await
}

/// Run the serve loop over arbitrary streams (tests drive it with
/// in-memory pipes).
pub async fn serve<R, W>(
    router: Arc<RouterCore>,
    config: &Config,
    input: R,
    output: W,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Single writer task owns the output stream.
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = out_rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            if output.flush().await.is_err() {
                break;
            }
        }
    });

    // The tools-changed hook queues notifications; they are flushed
    // after the response that triggered them so ordering holds.
    let pending_notifications: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let pending = Arc::clone(&pending_notifications);
        router.set_tools_changed_callback(Box::new(move |added, removed| {
            debug!(
                "Queueing tools/list_changed (+{} -{})",
                added.len(),
                removed.len()
            );
            let notification =
                serde_json::to_string(&JsonRpcRequest::notification(NOTIFY_TOOLS_CHANGED, None))?;
            pending.lock().expect("notification queue poisoned").push(notification);
            Ok(())
        }));
    }

    // Advisory reaper for idle rate-limit sessions.
    let reaper = {
        let router = Arc::clone(&router);
        let idle_secs = config.gateway.session_idle_secs;
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(idle_secs.max(60)));
            loop {
                tick.tick().await;
                router.reap_idle_sessions(chrono::Duration::seconds(idle_secs as i64));
            }
        })
    };

    let session = router.session_id().await;
    let cancel = CancellationToken::new();
    let mut reader = BufReader::new(input).lines();

    info!("Gateway serving on stdio (session {})", session);

    while let Some(line) = reader.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("Unparseable request line: {}", e);
                send(&out_tx, &JsonRpcResponse::failure(None, codes::PARSE_ERROR, "Parse error"));
                continue;
            }
        };

        if request.is_notification() {
            handle_notification(&request);
            continue;
        }

        let response = handle_request(&router, &session, &request, &cancel).await;
        send(&out_tx, &response);

        // Flush notifications triggered by this request, strictly after
        // its response.
        let queued: Vec<String> = {
            let mut pending = pending_notifications.lock().expect("notification queue poisoned");
            pending.drain(..).collect()
        };
        for notification in queued {
            let _ = out_tx.send(notification);
        }
    }

    info!("Client closed stdin; shutting down");
    cancel.cancel();
    reaper.abort();
    router.stop_servers().await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn handle_notification(request: &JsonRpcRequest) {
    match request.method.as_str() {
        "initialized" | "notifications/initialized" => {
            debug!("Client initialization complete");
        }
        other => debug!("Ignoring notification '{}'", other),
    }
}

async fn handle_request(
    router: &Arc<RouterCore>,
    session: &str,
    request: &JsonRpcRequest,
    cancel: &CancellationToken,
) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => handle_initialize(router, request).await,
        "tools/list" | "tools/call" => {
            match router
                .route_request(session, &request.method, request.params.clone(), cancel)
                .await
            {
                Ok(result) => JsonRpcResponse::success(request.id.clone(), result),
                Err(e) => error_response(request.id.clone(), e),
            }
        }
        other => JsonRpcResponse::failure(
            request.id.clone(),
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        ),
    }
}

/// The handshake doubles as identity resolution: the declared client
/// name and skills pick the initial role.
async fn handle_initialize(router: &Arc<RouterCore>, request: &JsonRpcRequest) -> JsonRpcResponse {
    let params: InitializeParams = request
        .params
        .clone()
        .and_then(|p| serde_json::from_value(p).ok())
        .unwrap_or_default();

    let agent = AgentIdentity {
        name: params
            .client_info
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_default(),
        version: params.client_info.as_ref().and_then(|c| c.version.clone()),
        skills: params
            .skills
            .iter()
            .map(|s| SkillDeclaration {
                id: s.id.clone(),
                name: s.name.clone(),
                description: s.description.clone(),
                io_modes: s.io_modes.clone(),
            })
            .collect(),
        metadata: Value::Null,
    };

    let resolution = match router.resolve_identity(&agent).await {
        Ok(r) => r,
        Err(e @ GatewayError::UnknownAgent { .. }) => {
            return error_response(request.id.clone(), e);
        }
        Err(e) => return error_response(request.id.clone(), e),
    };
    info!(
        "Agent '{}' resolved to role '{}' (trusted: {})",
        resolution.agent_name, resolution.role_id, resolution.is_trusted
    );

    if let Err(e) = router
        .set_role(SetRoleOptions {
            role: resolution.role_id.clone(),
            include_descriptions: false,
        })
        .await
    {
        warn!("Initial role activation failed: {}", e);
    }

    JsonRpcResponse::success(
        request.id.clone(),
        json!({
            "protocolVersion": crate::upstream::PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
            },
            "serverInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "roleId": resolution.role_id,
            "trusted": resolution.is_trusted,
        }),
    )
}

fn send(out_tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = out_tx.send(line);
        }
        Err(e) => warn!("Failed to serialize response: {}", e),
    }
}

/// Map gateway errors to JSON-RPC envelopes. Upstream error envelopes
/// keep their original code.
fn error_response(id: Option<Value>, err: GatewayError) -> JsonRpcResponse {
    let (code, message) = match &err {
        GatewayError::Upstream { code, message } => (*code, message.clone()),
        GatewayError::UnknownAgent { .. } => (-32001, err.to_string()),
        GatewayError::Cancelled => (-32800, err.to_string()),
        GatewayError::Timeout { .. }
        | GatewayError::UpstreamClosed { .. }
        | GatewayError::NoHealthyUpstreams { .. } => (-32000, err.to_string()),
        _ => (codes::INTERNAL_ERROR, err.to_string()),
    };
    let mut response = JsonRpcResponse::failure(id, code, message);
    if let Some(error) = &mut response.error {
        error.data = Some(json!({ "kind": err.kind() }));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::identity::IdentityConfig;
    use crate::skills::SkillManifest;
    use crate::upstream::{UpstreamConfig, UpstreamPool};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const PY_SERVER: &str = r#"
import sys, json

def reply(id, result):
    sys.stdout.write(json.dumps({"jsonrpc": "2.0", "id": id, "result": result}) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    if "id" not in req:
        continue
    method = req.get("method")
    if method == "initialize":
        reply(req["id"], {"protocolVersion": "2024-11-05"})
    elif method == "tools/list":
        reply(req["id"], {"tools": [{"name": "read", "inputSchema": {"type": "object"}}]})
    elif method == "tools/call":
        reply(req["id"], {"content": [{"type": "text", "text": "done"}], "isError": False})
    else:
        reply(req["id"], {})
"#;

    const MANIFEST: &str = r#"{
        "version": "1",
        "skills": [
            {
                "id": "filesystem",
                "allowedRoles": ["developer"],
                "allowedTools": ["fs__read"],
                "identity": {
                    "skillMatching": [
                        {"role": "developer", "anySkills": ["coding"], "priority": 10}
                    ],
                    "trustedPrefixes": ["claude-"]
                }
            }
        ]
    }"#;

    async fn build_router() -> Arc<RouterCore> {
        let (tx, _rx) = events::channel();
        let pool = Arc::new(UpstreamPool::new(tx.clone(), Duration::from_secs(5)));
        pool.add_server(
            "fs",
            UpstreamConfig {
                command: "python3".into(),
                args: vec!["-c".into(), PY_SERVER.into()],
                env: HashMap::new(),
                cwd: None,
                disabled: false,
            },
        )
        .await;
        pool.start_all().await;

        let mut identity = IdentityConfig::default();
        identity.default_role = "developer".into();

        let router = Arc::new(RouterCore::new(Config::default(), pool, tx));
        router
            .initialize_with(SkillManifest::parse(MANIFEST).unwrap(), identity)
            .await
            .unwrap();
        router
    }

    /// Drive the serve loop through an in-memory duplex pipe and return
    /// every line the server wrote.
    async fn run_session(requests: Vec<Value>) -> Vec<Value> {
        let router = build_router().await;
        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);

        let config = Config::default();
        let serve_task = tokio::spawn(async move {
            let _ = serve(router, &config, server_in, server_out).await;
        });

        let mut client_in = client_in;
        for req in requests {
            let line = serde_json::to_string(&req).unwrap();
            client_in.write_all(line.as_bytes()).await.unwrap();
            client_in.write_all(b"\n").await.unwrap();
        }
        drop(client_in);

        let mut lines = Vec::new();
        let mut reader = BufReader::new(client_out).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        let _ = serve_task.await;
        lines
    }

    #[tokio::test]
    async fn handshake_resolves_identity_and_lists_tools() {
        let out = run_session(vec![
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {"name": "claude-dev"},
                    "skills": [{"id": "coding"}]
                }
            }),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        ])
        .await;

        let init = out
            .iter()
            .find(|v| v["id"] == 1)
            .expect("initialize response");
        assert_eq!(init["result"]["roleId"], "developer");
        assert_eq!(init["result"]["trusted"], true);
        assert_eq!(init["result"]["capabilities"]["tools"]["listChanged"], true);

        let list = out.iter().find(|v| v["id"] == 2).expect("tools/list response");
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"fs__read"));
        assert!(names.contains(&"set_role"));
    }

    #[tokio::test]
    async fn notification_follows_the_triggering_response() {
        let out = run_session(vec![
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"clientInfo": {"name": "x"}, "skills": [{"id": "coding"}]}
            }),
        ])
        .await;

        // The initial role switch changes the (empty) table, so the
        // list_changed notification must appear after the response.
        let response_pos = out.iter().position(|v| v["id"] == 1).unwrap();
        let notify_pos = out
            .iter()
            .position(|v| v["method"] == NOTIFY_TOOLS_CHANGED)
            .expect("list_changed notification");
        assert!(notify_pos > response_pos);
    }

    #[tokio::test]
    async fn tool_call_roundtrip_over_stdio() {
        let out = run_session(vec![
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"clientInfo": {"name": "x"}, "skills": [{"id": "coding"}]}
            }),
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "fs__read", "arguments": {"path": "/tmp"}}
            }),
        ])
        .await;

        let call = out.iter().find(|v| v["id"] == 2).unwrap();
        assert_eq!(call["result"]["isError"], false);
        assert_eq!(call["result"]["content"][0]["text"], "done");
    }

    #[tokio::test]
    async fn unknown_method_and_bad_json_are_survivable() {
        let router = build_router().await;
        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        let config = Config::default();
        let serve_task = tokio::spawn(async move {
            let _ = serve(router, &config, server_in, server_out).await;
        });

        let mut client_in = client_in;
        client_in.write_all(b"this is not json\n").await.unwrap();
        client_in
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"prompts/list\"}\n")
            .await
            .unwrap();
        drop(client_in);

        let mut lines = Vec::new();
        let mut reader = BufReader::new(client_out).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        let _ = serve_task.await;

        assert_eq!(lines[0]["error"]["code"], codes::PARSE_ERROR);
        let unknown = lines.iter().find(|v| v["id"] == 5).unwrap();
        assert_eq!(unknown["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn upstream_errors_keep_their_code() {
        let resp = error_response(
            Some(Value::from(1)),
            GatewayError::Upstream {
                code: -32602,
                message: "bad params".into(),
            },
        );
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32602);
        assert_eq!(err.data.unwrap()["kind"], "upstream_error");
    }

    #[test]
    fn transport_errors_use_server_error_code() {
        let resp = error_response(
            Some(Value::from(2)),
            GatewayError::NoHealthyUpstreams { tool: "fs__read".into() },
        );
        assert_eq!(resp.error.unwrap().code, -32000);
    }
}
