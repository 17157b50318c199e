use thiserror::Error;

/// Errors surfaced to gateway callers. Access-control denials, quota
/// denials and upstream failures all land here so the router can audit
/// them uniformly before returning an error envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown agent: no skill rule matched '{agent}' and rejectUnknown is set")]
    UnknownAgent { agent: String },

    #[error("role '{role}' not found (known roles: {})", known.join(", "))]
    RoleNotFound { role: String, known: Vec<String> },

    #[error("server '{server}' is not accessible for role '{role}'")]
    ServerNotAccessible { server: String, role: String },

    #[error("tool '{tool}' is not accessible for role '{role}'")]
    ToolNotAccessible { tool: String, role: String },

    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_ms: u64 },

    #[error("no healthy upstreams for tool '{tool}'")]
    NoHealthyUpstreams { tool: String },

    #[error("request to '{server}' timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    #[error("upstream '{server}' closed the connection")]
    UpstreamClosed { server: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid time range '{0}' (expected HH:MM-HH:MM)")]
    InvalidTimeRange(String),

    #[error("invalid time zone '{0}'")]
    InvalidTimeZone(String),

    #[error("request cancelled")]
    Cancelled,

    /// JSON-RPC error envelope received from an upstream, propagated
    /// unchanged after audit.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the retry envelope may re-attempt after this error.
    /// Matches the default retryable set: connection-level failures and
    /// timeouts. Access denials and config errors abort immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::UpstreamClosed { .. }
        )
    }

    /// Short machine-readable kind used in audit entries and error results.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UnknownAgent { .. } => "unknown_agent",
            GatewayError::RoleNotFound { .. } => "role_not_found",
            GatewayError::ServerNotAccessible { .. } => "server_not_accessible",
            GatewayError::ToolNotAccessible { .. } => "tool_not_accessible",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::NoHealthyUpstreams { .. } => "no_healthy_upstreams",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::UpstreamClosed { .. } => "upstream_closed",
            GatewayError::InvalidConfig(_) => "invalid_config",
            GatewayError::InvalidTimeRange(_) => "invalid_time_range",
            GatewayError::InvalidTimeZone(_) => "invalid_time_zone",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// True for denials produced before any upstream contact.
    #[allow(dead_code)]
    pub fn is_access_denial(&self) -> bool {
        matches!(
            self,
            GatewayError::ServerNotAccessible { .. }
                | GatewayError::ToolNotAccessible { .. }
                | GatewayError::RateLimited { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
