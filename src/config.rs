use crate::audit::rate_limit::Quota;
use crate::roles::RoleOverlay;
use crate::strategy::StrategyConfig;
use crate::upstream::UpstreamConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variables recognized by the gateway.
pub const ENV_SKILL_MANIFEST: &str = "TOOLGATE_SKILL_MANIFEST";
pub const ENV_UPSTREAMS: &str = "TOOLGATE_UPSTREAMS";
pub const ENV_BACKEND_BIN: &str = "TOOLGATE_BACKEND_BIN";
pub const ENV_SILENT: &str = "TOOLGATE_SILENT";
pub const ENV_STDIO: &str = "TOOLGATE_STDIO";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Inline upstream table; merged under any file named by
    /// `TOOLGATE_UPSTREAMS` or `gateway.upstreams_file`.
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Per-role quotas, keyed by role id.
    #[serde(default)]
    pub quotas: HashMap<String, Quota>,
    /// Per-role overlays on the derived catalogue.
    #[serde(default)]
    pub roles: BTreeMap<String, RoleOverlay>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Path to the skill manifest (JSON).
    #[serde(default)]
    pub skill_manifest: Option<PathBuf>,
    /// Path to the identity overlay (YAML).
    #[serde(default)]
    pub identity_config: Option<PathBuf>,
    /// Path to an external upstream table (JSON).
    #[serde(default)]
    pub upstreams_file: Option<PathBuf>,
    /// Southbound request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Spawn every configured upstream at startup instead of lazily on
    /// the first role that needs it.
    #[serde(default)]
    pub eager_start: bool,
    /// TTL for cached remote system instructions.
    #[serde(default = "default_instruction_ttl_secs")]
    pub instruction_ttl_secs: u64,
    /// Reap rate-limit sessions idle longer than this.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_instruction_ttl_secs() -> u64 {
    300
}
fn default_session_idle_secs() -> u64 {
    1800
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            skill_manifest: None,
            identity_config: None,
            upstreams_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            eager_start: false,
            instruction_ttl_secs: default_instruction_ttl_secs(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub retention_days: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

fn default_audit_capacity() -> usize {
    crate::audit::DEFAULT_AUDIT_CAPACITY
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
        }
    }
}

impl Config {
    /// Load `toolgate.toml` from the given path, the working directory,
    /// or `~/.toolgate/config/`, then apply environment overrides.
    pub fn load_with_path(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let candidate = explicit
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("toolgate.toml"));
        let resolved = if candidate.exists() {
            Some(candidate)
        } else if explicit.is_none() {
            global_config_file().filter(|p| p.exists())
        } else {
            None
        };
        let (mut config, path) = match resolved {
            Some(path) => {
                let content = fs::read_to_string(&path)?;
                (toml::from_str::<Config>(&content)?, Some(path))
            }
            None => (Config::default(), None),
        };
        config.apply_env();
        Ok((config, path))
    }

    /// Fold process-control environment variables into the config.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(ENV_SKILL_MANIFEST) {
            if !path.trim().is_empty() {
                self.gateway.skill_manifest = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var(ENV_UPSTREAMS) {
            if !path.trim().is_empty() {
                self.gateway.upstreams_file = Some(PathBuf::from(path));
            }
        }
    }

    /// The merged upstream table: the external file (when configured)
    /// overrides inline entries of the same name. With no entries at
    /// all, a `TOOLGATE_BACKEND_BIN` binary becomes the single default
    /// upstream.
    pub fn resolve_upstreams(&self) -> Result<HashMap<String, UpstreamConfig>> {
        let mut table = self.upstreams.clone();
        if let Some(path) = &self.gateway.upstreams_file {
            let content = fs::read_to_string(path)?;
            let external: HashMap<String, UpstreamConfig> = serde_json::from_str(&content)?;
            table.extend(external);
        }
        if table.is_empty() {
            if let Ok(bin) = std::env::var(ENV_BACKEND_BIN) {
                if !bin.trim().is_empty() {
                    table.insert(
                        "builtin".to_string(),
                        UpstreamConfig {
                            command: bin,
                            args: vec!["serve-tools".into()],
                            env: HashMap::new(),
                            cwd: None,
                            disabled: false,
                        },
                    );
                }
            }
        }
        Ok(table)
    }
}

/// Global config fallback, consulted when the working directory has no
/// `toolgate.toml`: `$TOOLGATE_HOME/config/toolgate.toml`, else the
/// same path under `~/.toolgate`.
fn global_config_file() -> Option<PathBuf> {
    let home = std::env::var("TOOLGATE_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".toolgate")))?;
    Some(home.join("config").join("toolgate.toml"))
}

/// Whether the process was asked to keep its own stdout clean (stdio
/// transport) or to stay quiet entirely.
pub fn silent_mode() -> bool {
    env_flag(ENV_SILENT) || stdio_mode()
}

pub fn stdio_mode() -> bool {
    env_flag(ENV_STDIO)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_lowercase();
            !v.is_empty() && v != "0" && v != "false"
        })
        .unwrap_or(false)
}
