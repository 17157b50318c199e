// Gateway event bus. Components publish typed events over an unbounded
// channel; the serve loop drains them into structured logs and operators
// can tap the stream for monitoring.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    UpstreamStarted {
        server: String,
    },
    UpstreamExited {
        server: String,
        code: Option<i32>,
    },
    BreakerTransition {
        server: String,
        from: String,
        to: String,
    },
    Failover {
        tool: String,
        from: String,
        to: String,
    },
    RateLimitWarning {
        role: String,
        session: String,
        window: String,
        usage: u64,
        limit: u64,
    },
    RateLimitExceeded {
        role: String,
        session: String,
        reason: String,
    },
    RoleSwitched {
        previous: Option<String>,
        current: String,
        tools_added: usize,
        tools_removed: usize,
    },
    ToolsChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget publish; a closed receiver is not an error.
pub fn emit(tx: &EventSender, event: GatewayEvent) {
    let _ = tx.send(event);
}

/// Drain events into the log until every sender is dropped.
pub async fn log_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match &event {
            GatewayEvent::BreakerTransition { server, from, to } => {
                warn!("Circuit breaker for '{}' moved {} -> {}", server, from, to);
            }
            GatewayEvent::RateLimitExceeded { role, session, reason } => {
                warn!("Rate limit exceeded for role '{}' (session {}): {}", role, session, reason);
            }
            GatewayEvent::RateLimitWarning { role, window, usage, limit, .. } => {
                warn!(
                    "Role '{}' at {}/{} of its {} window",
                    role, usage, limit, window
                );
            }
            GatewayEvent::UpstreamExited { server, code } => {
                warn!("Upstream '{}' exited (code {:?})", server, code);
            }
            GatewayEvent::Failover { tool, from, to } => {
                warn!("Failover for '{}': {} -> {}", tool, from, to);
            }
            other => info!("{:?}", other),
        }
    }
}
