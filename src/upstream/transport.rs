// Child-process transport: one JSON object per line on the child's
// stdin/stdout, responses correlated by integer id. A dedicated reader
// task demultiplexes responses; writes are serialized through a channel
// so concurrent callers can never interleave partial lines.

use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct UpstreamTransport {
    server: String,
    writer_tx: mpsc::Sender<String>,
    pending: PendingMap,
    child: Arc<Mutex<Option<Child>>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl UpstreamTransport {
    /// Spawn the child and wire up reader/writer/stderr tasks.
    /// `on_exit` fires once when the child's stdout closes.
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&PathBuf>,
        on_exit: impl FnOnce(Option<i32>) + Send + 'static,
    ) -> GatewayResult<Self> {
        info!("Spawning upstream '{}': {} {}", server, command, args.join(" "));

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Internal(format!("failed to spawn upstream '{}': {}", server, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Internal(format!("no stdin for '{}'", server)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Internal(format!("no stdout for '{}'", server)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Internal(format!("no stderr for '{}'", server)))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let child = Arc::new(Mutex::new(Some(child)));

        // Writer task: owns stdin, appends the line terminator.
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        {
            let server = server.to_string();
            let mut stdin = stdin;
            tokio::spawn(async move {
                while let Some(line) = writer_rx.recv().await {
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        warn!("Upstream '{}' stdin write failed: {}", server, e);
                        break;
                    }
                    if let Err(e) = stdin.write_all(b"\n").await {
                        warn!("Upstream '{}' stdin write failed: {}", server, e);
                        break;
                    }
                    if let Err(e) = stdin.flush().await {
                        warn!("Upstream '{}' stdin flush failed: {}", server, e);
                        break;
                    }
                }
                debug!("Upstream '{}' writer task exiting", server);
            });
        }

        // Reader task: demultiplex responses by id; unknown or malformed
        // lines are logged and ignored. Dropping the pending map on exit
        // completes every in-flight request with UpstreamClosed.
        {
            let server = server.to_string();
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let child = Arc::clone(&child);
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stdout, LinesCodec::new());
                while let Some(item) = lines.next().await {
                    let line = match item {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("Upstream '{}' read error: {}", server, e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(&line) {
                        Ok(resp) => match resp.numeric_id() {
                            Some(id) => {
                                let mut map = pending.lock().await;
                                if let Some(tx) = map.remove(&id) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!(
                                        "Upstream '{}' response for unknown id={}, dropping",
                                        server, id
                                    );
                                }
                            }
                            None => {
                                debug!(
                                    "Upstream '{}' notification: {:.120}",
                                    server, line
                                );
                            }
                        },
                        Err(e) => {
                            warn!("Upstream '{}' unparseable line ({}): {:.120}", server, e, line);
                        }
                    }
                }

                connected.store(false, Ordering::SeqCst);
                pending.lock().await.clear();

                let code = {
                    let mut guard = child.lock().await;
                    match guard.as_mut() {
                        Some(c) => c.wait().await.ok().and_then(|s| s.code()),
                        None => None,
                    }
                };
                info!("Upstream '{}' stdout closed (exit code {:?})", server, code);
                on_exit(code);
            });
        }

        // Stderr drain: surfaced as logs.
        {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                debug!("[{}:stderr] {}", server, trimmed);
                            }
                        }
                        Err(e) => {
                            warn!("Upstream '{}' stderr read error: {}", server, e);
                            break;
                        }
                    }
                }
            });
        }

        Ok(Self {
            server: server.to_string(),
            writer_tx,
            pending,
            child,
            next_id: AtomicU64::new(1),
            connected,
        })
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request and await its response. On timeout the pending
    /// entry is removed; on cancellation the entry is removed and
    /// `Cancelled` returned (a late reply is dropped by the reader).
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> GatewayResult<JsonRpcResponse> {
        let id = request
            .numeric_id()
            .ok_or_else(|| GatewayError::Internal("southbound request without id".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&request)
            .map_err(|e| GatewayError::Internal(format!("serialize request: {}", e)))?;
        if self.writer_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::UpstreamClosed {
                server: self.server.clone(),
            });
        }

        tokio::select! {
            resp = rx => resp.map_err(|_| GatewayError::UpstreamClosed {
                server: self.server.clone(),
            }),
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout {
                    server: self.server.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Cancelled)
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Option<serde_json::Value>) -> GatewayResult<()> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(|e| GatewayError::Internal(format!("serialize notification: {}", e)))?;
        self.writer_tx.send(line).await.map_err(|_| GatewayError::UpstreamClosed {
            server: self.server.clone(),
        })
    }

    /// Kill the child. In-flight requests complete with UpstreamClosed
    /// once the reader observes the closed stream.
    pub async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            debug!("Killing upstream '{}'", self.server);
            let _ = child.kill().await;
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An upstream that echoes every request back as a successful result
    // lets the transport be exercised end-to-end with a real child
    // process and real pipes.
    const ECHO_SERVER: &str = r#"
import sys, json
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    if "id" not in req:
        continue
    resp = {"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;

    async fn spawn_echo() -> UpstreamTransport {
        UpstreamTransport::spawn(
            "echo",
            "python3",
            &["-c".to_string(), ECHO_SERVER.to_string()],
            &HashMap::new(),
            None,
            |_| {},
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let t = spawn_echo().await;
        let req = JsonRpcRequest::new(t.next_id(), "tools/list", None);
        let resp = t
            .send_request(req, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["echo"], "tools/list");
        t.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_by_id() {
        let t = Arc::new(spawn_echo().await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = Arc::clone(&t);
            handles.push(tokio::spawn(async move {
                let id = t.next_id();
                let req = JsonRpcRequest::new(id, &format!("method/{}", id), None);
                let resp = t
                    .send_request(req, Duration::from_secs(5), &CancellationToken::new())
                    .await
                    .unwrap();
                assert_eq!(resp.result.unwrap()["echo"], format!("method/{}", id));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        t.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_produces_timeout_error() {
        // A child that never answers.
        let t = UpstreamTransport::spawn(
            "silent",
            "python3",
            &["-c".to_string(), "import time; time.sleep(60)".to_string()],
            &HashMap::new(),
            None,
            |_| {},
        )
        .await
        .unwrap();
        let req = JsonRpcRequest::new(t.next_id(), "ping", None);
        let err = t
            .send_request(req, Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        t.shutdown().await;
    }

    #[tokio::test]
    async fn child_exit_fails_in_flight_with_upstream_closed() {
        let t = UpstreamTransport::spawn(
            "dying",
            "python3",
            &[
                "-c".to_string(),
                "import sys; sys.stdin.readline(); sys.exit(3)".to_string(),
            ],
            &HashMap::new(),
            None,
            |_| {},
        )
        .await
        .unwrap();
        let req = JsonRpcRequest::new(t.next_id(), "ping", None);
        let err = t
            .send_request(req, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamClosed { .. }));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn cancellation_releases_pending_entry() {
        let t = UpstreamTransport::spawn(
            "silent",
            "python3",
            &["-c".to_string(), "import time; time.sleep(60)".to_string()],
            &HashMap::new(),
            None,
            |_| {},
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = JsonRpcRequest::new(t.next_id(), "ping", None);
        let err = t
            .send_request(req, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert!(t.pending.lock().await.is_empty());
        t.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_lines_are_ignored() {
        const NOISY: &str = r#"
import sys, json
sys.stdout.write("not json at all\n")
sys.stdout.write(json.dumps({"jsonrpc": "2.0", "method": "notify/something"}) + "\n")
sys.stdout.flush()
for line in sys.stdin:
    req = json.loads(line)
    resp = {"jsonrpc": "2.0", "id": req["id"], "result": {}}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;
        let t = UpstreamTransport::spawn(
            "noisy",
            "python3",
            &["-c".to_string(), NOISY.to_string()],
            &HashMap::new(),
            None,
            |_| {},
        )
        .await
        .unwrap();
        let req = JsonRpcRequest::new(t.next_id(), "ping", None);
        let resp = t
            .send_request(req, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.result.is_some());
        t.shutdown().await;
    }
}
