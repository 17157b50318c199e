pub mod instruction;
pub mod manifest;

use crate::audit::rate_limit::RateLimiter;
use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{self, EventSender, GatewayEvent};
use crate::identity::{AgentIdentity, IdentityConfig, IdentityResolution, IdentityResolver};
use crate::roles::{ListRolesOptions, Role, RoleManager, RoleSummary};
use crate::rpc::{ToolCallParams, ToolCallResult, ToolDef};
use crate::skills::SkillManifest;
use crate::upstream::{split_prefixed, UpstreamPool};
use chrono::{DateTime, Utc};
use instruction::InstructionFetcher;
use manifest::{AgentManifest, ManifestTool};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SET_ROLE_TOOL: &str = "set_role";
pub const GET_MANIFEST_TOOL: &str = "get_agent_manifest";
pub const LIST_ROLES_TOOL: &str = "list_roles";

/// One entry in the virtual tool table. Hidden entries keep their
/// reason so operators can see why a tool is absent for the role.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub def: ToolDef,
    pub server: String,
    pub visible: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub name: String,
    pub connected: bool,
    pub active_for_role: bool,
    pub tool_count: usize,
    pub health: crate::strategy::HealthState,
}

/// Snapshot of the router for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    pub current_role: Option<String>,
    pub roles: Vec<String>,
    pub upstreams: Vec<UpstreamStatus>,
    pub visible_tools: Vec<String>,
    pub session_id: String,
    pub role_switch_count: u64,
    pub initialized_at: DateTime<Utc>,
    pub last_role_switch: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SetRoleOptions {
    pub role: String,
    pub include_descriptions: bool,
}

type ToolsChangedCallback = Box<dyn Fn(&[String], &[String]) -> anyhow::Result<()> + Send + Sync>;

struct RouterInner {
    current_role: Option<String>,
    instruction: String,
    /// Keyed by prefixed tool name; includes hidden entries.
    table: BTreeMap<String, ToolInfo>,
    active_servers: Vec<String>,
    session_id: String,
    role_switch_count: u64,
    initialized_at: DateTime<Utc>,
    last_role_switch: Option<DateTime<Utc>>,
}

/// Orchestrates identity, roles, the upstream pool, routing strategy and
/// the audit/rate-limit engine behind one routing surface.
pub struct RouterCore {
    config: Config,
    roles: RwLock<RoleManager>,
    identity: RwLock<IdentityResolver>,
    pool: Arc<UpstreamPool>,
    strategy: StdMutex<crate::strategy::StrategyEngine>,
    audit: Arc<AuditLog>,
    limiter: StdMutex<RateLimiter>,
    fetcher: InstructionFetcher,
    inner: RwLock<RouterInner>,
    tools_changed: StdMutex<Option<ToolsChangedCallback>>,
    events: EventSender,
}

impl RouterCore {
    pub fn new(config: Config, pool: Arc<UpstreamPool>, events: EventSender) -> Self {
        let strategy = crate::strategy::StrategyEngine::new(config.strategy.clone(), events.clone());
        let limiter = RateLimiter::new(config.quotas.clone(), events.clone());
        let audit = Arc::new(AuditLog::new(config.audit.capacity));
        let fetcher =
            InstructionFetcher::new(Duration::from_secs(config.gateway.instruction_ttl_secs));
        Self {
            config,
            roles: RwLock::new(RoleManager::new()),
            identity: RwLock::new(IdentityResolver::new(IdentityConfig::default())),
            pool,
            strategy: StdMutex::new(strategy),
            audit,
            limiter: StdMutex::new(limiter),
            fetcher,
            inner: RwLock::new(RouterInner {
                current_role: None,
                instruction: String::new(),
                table: BTreeMap::new(),
                active_servers: Vec::new(),
                session_id: uuid::Uuid::new_v4().to_string(),
                role_switch_count: 0,
                initialized_at: Utc::now(),
                last_role_switch: None,
            }),
            tools_changed: StdMutex::new(None),
            events,
        }
    }

    /// Handle for the export entry points.
    #[allow(dead_code)]
    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub async fn session_id(&self) -> String {
        self.inner.read().await.session_id.clone()
    }

    /// Load every configuration surface: the skill manifest, the
    /// identity overlay, and the role overlays. Optionally eager-starts
    /// the upstream fleet.
    pub async fn initialize(&self) -> GatewayResult<()> {
        let manifest = match &self.config.gateway.skill_manifest {
            Some(path) => SkillManifest::load(path)?,
            None => SkillManifest {
                version: "0".into(),
                generated_at: None,
                skills: Vec::new(),
            },
        };
        let identity_config = match &self.config.gateway.identity_config {
            Some(path) => IdentityConfig::load_yaml(path)?,
            None => IdentityConfig::default(),
        };
        self.initialize_with(manifest, identity_config).await
    }

    /// Initialize from already-parsed configuration surfaces.
    pub async fn initialize_with(
        &self,
        manifest: SkillManifest,
        identity_config: IdentityConfig,
    ) -> GatewayResult<()> {
        {
            let mut roles = self.roles.write().await;
            roles.load_from_skill_manifest(&manifest);
            roles.apply_overlays(&self.config.roles);
        }
        {
            let mut identity = self.identity.write().await;
            *identity = IdentityResolver::new(identity_config);
            identity.load_from_skills(&manifest.skills);
        }
        if self.config.gateway.eager_start {
            self.start_servers().await;
        }
        info!("Router initialized (session {})", self.session_id().await);
        Ok(())
    }

    pub async fn resolve_identity(
        &self,
        agent: &AgentIdentity,
    ) -> GatewayResult<IdentityResolution> {
        let mut identity = self.identity.write().await;
        identity.resolve(agent)
    }

    pub async fn start_servers(&self) -> usize {
        self.pool.start_all().await
    }

    /// Start only the upstreams a role is allowed to reach.
    pub async fn start_servers_for_role(&self, role_id: &str) -> GatewayResult<usize> {
        let role = self.lookup_role(role_id).await?;
        let names = if role.allows_all_servers() {
            self.pool.server_names().await
        } else {
            role.allowed_servers.clone()
        };
        Ok(self.pool.start_by_name(&names).await)
    }

    pub async fn stop_servers(&self) {
        self.pool.stop_all().await;
    }

    pub fn set_tools_changed_callback(&self, cb: ToolsChangedCallback) {
        *self.tools_changed.lock().expect("callback lock poisoned") = Some(cb);
    }

    pub async fn list_roles(&self, opts: ListRolesOptions) -> Vec<RoleSummary> {
        let current = self.inner.read().await.current_role.clone();
        self.roles.read().await.list_roles(opts, current.as_deref())
    }

    async fn lookup_role(&self, role_id: &str) -> GatewayResult<Role> {
        let roles = self.roles.read().await;
        roles
            .get_role(role_id)
            .cloned()
            .ok_or_else(|| GatewayError::RoleNotFound {
                role: role_id.to_string(),
                known: roles.role_ids(),
            })
    }

    // -- role activation ----------------------------------------------------

    /// Make `opts.role` the active role, rebuild the virtual tool table
    /// and notify the client when visibility changed. Returns the
    /// manifest for the new role.
    pub async fn set_role(&self, opts: SetRoleOptions) -> GatewayResult<AgentManifest> {
        let role = self.lookup_role(&opts.role).await?;

        let (previous_visible, previous_role, prior_instruction) = {
            let inner = self.inner.read().await;
            (
                visible_names(&inner.table),
                inner.current_role.clone(),
                inner.instruction.clone(),
            )
        };

        let instruction = match &role.remote_instruction {
            Some(remote) => {
                self.fetcher
                    .resolve(remote, Some(prior_instruction.as_str()))
                    .await
            }
            None => role.instruction.clone(),
        };

        // Bring up whatever the role needs before scanning tools.
        if let Err(e) = self.start_servers_for_role(&role.id).await {
            warn!("Starting servers for role '{}' failed: {}", role.id, e);
        }

        let (table, active_servers) = self.build_table(&role).await;
        let current_visible = visible_names(&table);

        let added: Vec<String> = current_visible
            .difference(&previous_visible)
            .cloned()
            .collect();
        let removed: Vec<String> = previous_visible
            .difference(&current_visible)
            .cloned()
            .collect();
        let tools_changed = !added.is_empty() || !removed.is_empty();

        {
            let mut inner = self.inner.write().await;
            inner.current_role = Some(role.id.clone());
            inner.instruction = instruction.clone();
            inner.table = table;
            inner.active_servers = active_servers.clone();
            inner.role_switch_count += 1;
            inner.last_role_switch = Some(Utc::now());
        }

        info!(
            "Role switched {:?} -> '{}' ({} tools visible)",
            previous_role,
            role.id,
            current_visible.len()
        );
        events::emit(
            &self.events,
            GatewayEvent::RoleSwitched {
                previous: previous_role,
                current: role.id.clone(),
                tools_added: added.len(),
                tools_removed: removed.len(),
            },
        );

        if tools_changed {
            self.fire_tools_changed(&added, &removed);
        }

        Ok(self
            .build_manifest(&role, instruction, opts.include_descriptions, tools_changed)
            .await)
    }

    /// Reload the skill manifest and identity overlay from disk, replace
    /// the catalogue atomically, refresh discovery, and re-filter the
    /// table for the current role.
    pub async fn reload_roles(&self) -> GatewayResult<()> {
        let manifest = match &self.config.gateway.skill_manifest {
            Some(path) => SkillManifest::load(path)?,
            None => return Ok(()),
        };
        let identity_config = match &self.config.gateway.identity_config {
            Some(path) => IdentityConfig::load_yaml(path)?,
            None => IdentityConfig::default(),
        };

        {
            let mut roles = self.roles.write().await;
            roles.load_from_skill_manifest(&manifest);
            roles.apply_overlays(&self.config.roles);
        }
        {
            let mut identity = self.identity.write().await;
            *identity = IdentityResolver::new(identity_config);
            identity.load_from_skills(&manifest.skills);
        }

        self.pool.refresh_tools().await;

        let current = self.inner.read().await.current_role.clone();
        if let Some(role_id) = current {
            match self.lookup_role(&role_id).await {
                Ok(role) => {
                    let previous_visible = visible_names(&self.inner.read().await.table);
                    let (table, active_servers) = self.build_table(&role).await;
                    let current_visible = visible_names(&table);
                    let added: Vec<String> =
                        current_visible.difference(&previous_visible).cloned().collect();
                    let removed: Vec<String> =
                        previous_visible.difference(&current_visible).cloned().collect();
                    {
                        let mut inner = self.inner.write().await;
                        inner.table = table;
                        inner.active_servers = active_servers;
                    }
                    if !added.is_empty() || !removed.is_empty() {
                        self.fire_tools_changed(&added, &removed);
                    }
                }
                Err(_) => {
                    // The current role vanished from the manifest; the
                    // table empties until the client switches again.
                    warn!("Current role '{}' no longer exists after reload", role_id);
                    let mut inner = self.inner.write().await;
                    let removed: Vec<String> =
                        visible_names(&inner.table).into_iter().collect();
                    inner.table = BTreeMap::new();
                    inner.active_servers.clear();
                    drop(inner);
                    if !removed.is_empty() {
                        self.fire_tools_changed(&[], &removed);
                    }
                }
            }
        }
        info!("Role catalogue reloaded");
        Ok(())
    }

    /// Scan discovered tools and keep those the role admits; the
    /// synthetic `set_role` tool is always present.
    async fn build_table(&self, role: &Role) -> (BTreeMap<String, ToolInfo>, Vec<String>) {
        let roles = self.roles.read().await;
        let mut table = BTreeMap::new();
        let mut active_servers: Vec<String> = Vec::new();

        for (server, def) in self.pool.all_tools().await {
            let prefixed = crate::upstream::prefixed_tool_name(&server, &def.name);
            let server_active = roles.is_server_allowed_for_role(role, &server);
            if server_active && !active_servers.contains(&server) {
                active_servers.push(server.clone());
            }
            let (visible, reason) = if !server_active {
                (false, "server not active for role".to_string())
            } else if !roles.is_tool_allowed_for_role(role, &prefixed, &server) {
                (false, "denied by role permissions".to_string())
            } else {
                (true, "ok".to_string())
            };
            table.insert(
                prefixed.clone(),
                ToolInfo {
                    def: ToolDef {
                        name: prefixed,
                        description: def.description.clone(),
                        input_schema: def.input_schema.clone(),
                    },
                    server: server.clone(),
                    visible,
                    reason,
                },
            );
        }

        table.insert(
            SET_ROLE_TOOL.to_string(),
            ToolInfo {
                def: ToolDef {
                    name: SET_ROLE_TOOL.into(),
                    description: Some(
                        "Switch the active role; returns the new agent manifest.".into(),
                    ),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "role": { "type": "string" },
                        },
                        "required": ["role"],
                    }),
                },
                server: "router".into(),
                visible: true,
                reason: "system".into(),
            },
        );

        (table, active_servers)
    }

    fn fire_tools_changed(&self, added: &[String], removed: &[String]) {
        events::emit(
            &self.events,
            GatewayEvent::ToolsChanged {
                added: added.to_vec(),
                removed: removed.to_vec(),
            },
        );
        let guard = self.tools_changed.lock().expect("callback lock poisoned");
        if let Some(cb) = guard.as_ref() {
            if let Err(e) = cb(added, removed) {
                warn!("tools-changed callback failed: {}", e);
            }
        }
    }

    async fn build_manifest(
        &self,
        role: &Role,
        instruction: String,
        include_descriptions: bool,
        tools_changed: bool,
    ) -> AgentManifest {
        let inner = self.inner.read().await;
        let tools: Vec<ManifestTool> = inner
            .table
            .values()
            .filter(|t| t.visible)
            .map(|t| ManifestTool {
                name: t.def.name.clone(),
                description: if include_descriptions {
                    t.def.description.clone()
                } else {
                    None
                },
            })
            .collect();
        AgentManifest::build(
            role,
            instruction,
            tools,
            inner.active_servers.clone(),
            tools_changed,
        )
    }

    // -- request routing ----------------------------------------------------

    /// Dispatch one client request. `tools/list` is answered from the
    /// virtual table; `tools/call` runs the access-check / strategy /
    /// retry / audit path.
    pub async fn route_request(
        &self,
        session: &str,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> GatewayResult<Value> {
        match method {
            "tools/list" => {
                let inner = self.inner.read().await;
                let tools: Vec<&ToolDef> = inner
                    .table
                    .values()
                    .filter(|t| t.visible)
                    .map(|t| &t.def)
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let call: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(|e| {
                        GatewayError::Internal(format!("bad tools/call params: {}", e))
                    })?;
                let result = self.handle_tool_call(session, call, cancel).await?;
                serde_json::to_value(result)
                    .map_err(|e| GatewayError::Internal(format!("serialize result: {}", e)))
            }
            other => Err(GatewayError::Internal(format!(
                "router cannot handle method '{}'",
                other
            ))),
        }
    }

    async fn handle_tool_call(
        &self,
        session: &str,
        call: ToolCallParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<ToolCallResult> {
        match call.name.as_str() {
            SET_ROLE_TOOL => return self.handle_set_role_call(session, &call).await,
            GET_MANIFEST_TOOL => return self.handle_get_manifest_call().await,
            LIST_ROLES_TOOL => {
                let roles = self.list_roles(ListRolesOptions::default()).await;
                let text = serde_json::to_string_pretty(&roles)
                    .unwrap_or_else(|_| "[]".to_string());
                return Ok(ToolCallResult::text(text));
            }
            _ => {}
        }
        self.forward_tool_call(session, call, cancel).await
    }

    async fn handle_set_role_call(
        &self,
        session: &str,
        call: &ToolCallParams,
    ) -> GatewayResult<ToolCallResult> {
        let role = call
            .arguments
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if role.is_empty() {
            return Ok(ToolCallResult::error("set_role requires a 'role' argument"));
        }
        match self
            .set_role(SetRoleOptions {
                role: role.clone(),
                include_descriptions: true,
            })
            .await
        {
            Ok(manifest) => {
                self.record_audit(
                    session,
                    &role,
                    SET_ROLE_TOOL,
                    Some("router"),
                    call.arguments.clone(),
                    AuditOutcome::Allowed,
                    None,
                    None,
                );
                let text = serde_json::to_string_pretty(&manifest)
                    .unwrap_or_else(|_| "{}".to_string());
                Ok(ToolCallResult::text(text))
            }
            Err(e @ GatewayError::RoleNotFound { .. }) => {
                self.record_audit(
                    session,
                    &role,
                    SET_ROLE_TOOL,
                    Some("router"),
                    call.arguments.clone(),
                    AuditOutcome::Denied,
                    Some(e.to_string()),
                    None,
                );
                Ok(error_result(&e))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_get_manifest_call(&self) -> GatewayResult<ToolCallResult> {
        let (role_id, instruction) = {
            let inner = self.inner.read().await;
            match &inner.current_role {
                Some(role) => (role.clone(), inner.instruction.clone()),
                None => return Ok(ToolCallResult::error("no active role")),
            }
        };
        let role = self.lookup_role(&role_id).await?;
        let manifest = self.build_manifest(&role, instruction, true, false).await;
        let text =
            serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string());
        Ok(ToolCallResult::text(text))
    }

    /// The access-checked, rate-limited, strategy-routed forwarding path
    /// for ordinary tools.
    async fn forward_tool_call(
        &self,
        session: &str,
        call: ToolCallParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<ToolCallResult> {
        let (role_id, tool_info) = {
            let inner = self.inner.read().await;
            let Some(role_id) = inner.current_role.clone() else {
                return Ok(ToolCallResult::error(
                    "no active role; call set_role first",
                ));
            };
            (role_id, inner.table.get(&call.name).cloned())
        };

        // Access check: unknown tools and hidden tools never reach an
        // upstream.
        let info = match tool_info {
            Some(info) if info.visible => info,
            Some(info) => {
                let err = if info.reason.contains("server") {
                    GatewayError::ServerNotAccessible {
                        server: info.server.clone(),
                        role: role_id.clone(),
                    }
                } else {
                    GatewayError::ToolNotAccessible {
                        tool: call.name.clone(),
                        role: role_id.clone(),
                    }
                };
                self.record_audit(
                    session,
                    &role_id,
                    &call.name,
                    Some(&info.server),
                    call.arguments.clone(),
                    AuditOutcome::Denied,
                    Some(err.to_string()),
                    None,
                );
                return Ok(error_result(&err));
            }
            None => {
                let err = GatewayError::ToolNotAccessible {
                    tool: call.name.clone(),
                    role: role_id.clone(),
                };
                self.record_audit(
                    session,
                    &role_id,
                    &call.name,
                    None,
                    call.arguments.clone(),
                    AuditOutcome::Denied,
                    Some("unknown tool".into()),
                    None,
                );
                return Ok(error_result(&err));
            }
        };

        // Quota check before any upstream contact.
        let decision = {
            let mut limiter = self.limiter.lock().expect("limiter lock poisoned");
            limiter.check(&role_id, session, &call.name)
        };
        if !decision.allowed {
            let retry_after = decision.retry_after_ms.unwrap_or(0);
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "quota exceeded".into());
            self.record_audit(
                session,
                &role_id,
                &call.name,
                Some(&info.server),
                call.arguments.clone(),
                AuditOutcome::Denied,
                Some(reason.clone()),
                None,
            );
            let err = GatewayError::RateLimited {
                reason,
                retry_after_ms: retry_after,
            };
            let mut result = error_result(&err);
            result.metadata = Some(json!({ "retryAfterMs": retry_after }));
            return Ok(result);
        }

        // Skill-catalogue enumeration is filtered when the role declares
        // an allow-list.
        let bare = split_prefixed(&call.name)
            .map(|(_, t)| t.to_string())
            .unwrap_or_else(|| call.name.clone());
        let allowlist = {
            let roles = self.roles.read().await;
            roles.skill_allowlist(&role_id).map(|l| l.to_vec())
        };
        if let Some(allowlist) = &allowlist {
            if bare == "get_skill" {
                let requested = call
                    .arguments
                    .get("id")
                    .or_else(|| call.arguments.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !allowlist.iter().any(|s| s == requested) {
                    self.record_audit(
                        session,
                        &role_id,
                        &call.name,
                        Some(&info.server),
                        call.arguments.clone(),
                        AuditOutcome::Denied,
                        Some(format!("skill '{}' not in role allow-list", requested)),
                        None,
                    );
                    return Ok(ToolCallResult::error(format!(
                        "skill '{}' is not available to role '{}'",
                        requested, role_id
                    )));
                }
            }
        }

        {
            let mut limiter = self.limiter.lock().expect("limiter lock poisoned");
            limiter.consume(&role_id, session, &call.name);
            limiter.begin_concurrent(session);
        }
        let outcome = self
            .dispatch_with_retry(session, &role_id, &info, &bare, &call, cancel)
            .await;
        {
            let mut limiter = self.limiter.lock().expect("limiter lock poisoned");
            limiter.end_concurrent(session);
        }

        let mut result = outcome?;
        if let Some(allowlist) = &allowlist {
            if bare == "list_skills" {
                result = filter_skill_listing(result, allowlist);
            }
        }
        Ok(result)
    }

    /// Candidate selection, circuit-breaker accounting and the retry
    /// envelope around the actual upstream call.
    async fn dispatch_with_retry(
        &self,
        session: &str,
        role_id: &str,
        info: &ToolInfo,
        bare: &str,
        call: &ToolCallParams,
        cancel: &CancellationToken,
    ) -> GatewayResult<ToolCallResult> {
        // Every active server exposing the same bare tool is a
        // candidate; the prefix strategy will prefer the named one.
        let candidates: Vec<String> = {
            let inner = self.inner.read().await;
            let mut list: Vec<String> = inner
                .table
                .values()
                .filter(|t| t.visible && t.server != "router")
                .filter(|t| {
                    split_prefixed(&t.def.name).map(|(_, b)| b) == Some(bare)
                })
                .map(|t| t.server.clone())
                .collect();
            list.dedup();
            if list.is_empty() {
                list.push(info.server.clone());
            }
            list
        };

        let policy = {
            let strategy = self.strategy.lock().expect("strategy lock poisoned");
            strategy.retry_policy().clone()
        };

        let mut attempt: u32 = 0;
        loop {
            let server = {
                let mut strategy = self.strategy.lock().expect("strategy lock poisoned");
                match strategy.select(&call.name, &candidates, Instant::now()) {
                    Ok(server) => {
                        strategy.begin_request(&server, Instant::now());
                        server
                    }
                    Err(e) => {
                        self.record_audit(
                            session,
                            role_id,
                            &call.name,
                            None,
                            call.arguments.clone(),
                            AuditOutcome::Error,
                            Some(e.to_string()),
                            None,
                        );
                        return Err(e);
                    }
                }
            };

            let started = Instant::now();
            let result = self
                .pool
                .call_tool(&server, bare, call.arguments.clone(), cancel)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(tool_result) => {
                    {
                        let mut strategy =
                            self.strategy.lock().expect("strategy lock poisoned");
                        strategy.record_success(&server, elapsed_ms, Instant::now());
                    }
                    self.record_audit(
                        session,
                        role_id,
                        &call.name,
                        Some(&server),
                        call.arguments.clone(),
                        AuditOutcome::Allowed,
                        None,
                        Some(elapsed_ms),
                    );
                    return Ok(tool_result);
                }
                Err(e) => {
                    {
                        let mut strategy =
                            self.strategy.lock().expect("strategy lock poisoned");
                        strategy.record_failure(&server, Instant::now());
                    }
                    let retryable =
                        policy.is_retryable(&e) && attempt < policy.max_retries;
                    debug!(
                        "Call to '{}' via '{}' failed (attempt {}): {} (retry: {})",
                        call.name, server, attempt, e, retryable
                    );
                    if !retryable {
                        self.record_audit(
                            session,
                            role_id,
                            &call.name,
                            Some(&server),
                            call.arguments.clone(),
                            AuditOutcome::Error,
                            Some(e.to_string()),
                            Some(elapsed_ms),
                        );
                        return Err(e);
                    }
                    policy.wait(attempt, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Drop rate-limit counters for sessions idle beyond `max_idle`.
    pub fn reap_idle_sessions(&self, max_idle: chrono::Duration) -> usize {
        let mut limiter = self.limiter.lock().expect("limiter lock poisoned");
        let reaped = limiter.reap_idle(max_idle, Utc::now());
        if reaped > 0 {
            debug!("Reaped {} idle rate-limit sessions", reaped);
        }
        reaped
    }

    // -- state --------------------------------------------------------------

    pub async fn state(&self) -> RouterState {
        let inner = self.inner.read().await;
        let role_ids = self.roles.read().await.role_ids();
        let descriptors = self.pool.list_upstreams().await;
        let strategy = self.strategy.lock().expect("strategy lock poisoned");
        let upstreams = descriptors
            .into_iter()
            .map(|d| UpstreamStatus {
                active_for_role: inner.active_servers.contains(&d.name),
                health: strategy.health_of(&d.name),
                name: d.name,
                connected: d.connected,
                tool_count: d.tool_count,
            })
            .collect();
        RouterState {
            current_role: inner.current_role.clone(),
            roles: role_ids,
            upstreams,
            visible_tools: visible_names(&inner.table).into_iter().collect(),
            session_id: inner.session_id.clone(),
            role_switch_count: inner.role_switch_count,
            initialized_at: inner.initialized_at,
            last_role_switch: inner.last_role_switch,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_audit(
        &self,
        session: &str,
        role: &str,
        tool: &str,
        server: Option<&str>,
        args: Value,
        outcome: AuditOutcome,
        reason: Option<String>,
        duration_ms: Option<u64>,
    ) {
        self.audit.record(AuditRecord {
            session_id: session.to_string(),
            role_id: role.to_string(),
            tool: tool.to_string(),
            server: server.map(|s| s.to_string()),
            args,
            outcome,
            reason,
            duration_ms,
            metadata: Value::Null,
        });
    }
}

fn visible_names(table: &BTreeMap<String, ToolInfo>) -> BTreeSet<String> {
    table
        .values()
        .filter(|t| t.visible)
        .map(|t| t.def.name.clone())
        .collect()
}

fn error_result(err: &GatewayError) -> ToolCallResult {
    let mut result = ToolCallResult::error(err.to_string());
    result.metadata = Some(json!({ "errorKind": err.kind() }));
    result
}

/// Drop skill entries outside the allow-list from a `list_skills`
/// response. Content that does not parse as a JSON array passes through
/// unchanged.
fn filter_skill_listing(mut result: ToolCallResult, allowlist: &[String]) -> ToolCallResult {
    for block in &mut result.content {
        if let crate::rpc::ContentBlock::Text { text } = block {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) {
                let kept: Vec<Value> = items
                    .into_iter()
                    .filter(|item| {
                        item.get("id")
                            .or_else(|| item.get("name"))
                            .and_then(|v| v.as_str())
                            .map(|id| allowlist.iter().any(|s| s == id))
                            .unwrap_or(false)
                    })
                    .collect();
                *text = serde_json::to_string(&kept).unwrap_or_else(|_| "[]".into());
            } else {
                warn!("list_skills response is not a JSON array; passing through");
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::roles::{RoleOverlay, ToolPermissions};
    use crate::upstream::UpstreamConfig;
    use std::collections::HashMap;

    // A tool server whose tool names come from argv, so each test
    // upstream can expose a distinct surface.
    const PY_SERVER: &str = r#"
import sys, json

tools = sys.argv[1:]

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
        reply(req["id"], {"protocolVersion": "2024-11-05", "serverInfo": {"name": "py"}})
    elif method == "tools/list":
        reply(req["id"], {"tools": [{"name": t, "description": t, "inputSchema": {"type": "object"}} for t in tools]})
    elif method == "tools/call":
        name = req["params"]["name"]
        args = req["params"].get("arguments", {})
        reply(req["id"], {"content": [{"type": "text", "text": name + ":" + json.dumps(args)}], "isError": False})
    else:
        reply(req["id"], {})
"#;

    fn upstream(tools: &[&str]) -> UpstreamConfig {
        let mut args = vec!["-c".to_string(), PY_SERVER.to_string()];
        args.extend(tools.iter().map(|t| t.to_string()));
        UpstreamConfig {
            command: "python3".into(),
            args,
            env: HashMap::new(),
            cwd: None,
            disabled: false,
        }
    }

    const MANIFEST: &str = r#"{
        "version": "1",
        "skills": [
            {
                "id": "filesystem",
                "allowedRoles": ["developer", "admin"],
                "allowedTools": ["fs__read"]
            },
            {
                "id": "web_access",
                "allowedRoles": ["admin"],
                "allowedTools": ["web__fetch"]
            }
        ]
    }"#;

    async fn build_router(config: Config) -> Arc<RouterCore> {
        let (tx, _rx) = events::channel();
        let pool = Arc::new(UpstreamPool::new(tx.clone(), Duration::from_secs(5)));
        pool.add_server("fs", upstream(&["read", "write"])).await;
        pool.add_server("web", upstream(&["fetch"])).await;
        pool.start_all().await;

        let router = Arc::new(RouterCore::new(config, pool, tx));
        router
            .initialize_with(
                SkillManifest::parse(MANIFEST).unwrap(),
                IdentityConfig::default(),
            )
            .await
            .unwrap();
        router
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn set_role_builds_filtered_table_with_synthetic_tool() {
        let router = build_router(Config::default()).await;
        let manifest = router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: true,
            })
            .await
            .unwrap();

        let names: Vec<&str> = manifest.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"fs__read"));
        assert!(names.contains(&"set_role"));
        // Outside the allow scope and on a barred server respectively.
        assert!(!names.contains(&"fs__write"));
        assert!(!names.contains(&"web__fetch"));
        assert_eq!(manifest.role.id, "developer");
        assert!(manifest.metadata.tools_changed);
        assert!(manifest.instruction.contains("developer"));

        let state = router.state().await;
        assert_eq!(state.current_role.as_deref(), Some("developer"));
        assert_eq!(state.role_switch_count, 1);
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn unknown_role_reports_known_roles() {
        let router = build_router(Config::default()).await;
        let err = router
            .set_role(SetRoleOptions {
                role: "ghost".into(),
                include_descriptions: false,
            })
            .await
            .unwrap_err();
        match err {
            GatewayError::RoleNotFound { role, known } => {
                assert_eq!(role, "ghost");
                assert!(known.contains(&"developer".to_string()));
                assert!(known.contains(&"admin".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn tools_list_returns_virtual_table() {
        let router = build_router(Config::default()).await;
        router
            .set_role(SetRoleOptions {
                role: "admin".into(),
                include_descriptions: true,
            })
            .await
            .unwrap();

        let value = router
            .route_request("s1", "tools/list", None, &cancel())
            .await
            .unwrap();
        let tools = value["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert!(names.contains(&"fs__read"));
        assert!(names.contains(&"web__fetch"));
        assert!(names.contains(&"set_role"));
        assert!(!names.contains(&"fs__write"));
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn denied_tool_is_audited_without_upstream_contact() {
        let router = build_router(Config::default()).await;
        router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();

        let value = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "fs__write", "arguments": {"path": "/x"}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(value["isError"], true);

        let denied = router.audit_log().query(&AuditFilter {
            outcome: Some(AuditOutcome::Denied),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].tool, "fs__write");
        assert_eq!(denied[0].role_id, "developer");
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn allowed_tool_is_forwarded_and_audited() {
        let router = build_router(Config::default()).await;
        router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();

        let value = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "fs__read", "arguments": {"path": "/etc/hosts"}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(value["isError"], false);
        let text = value["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("read:"));

        let allowed = router.audit_log().query(&AuditFilter {
            outcome: Some(AuditOutcome::Allowed),
            ..Default::default()
        });
        assert_eq!(allowed.len(), 1);
        assert!(allowed[0].duration_ms.is_some());
        assert_eq!(allowed[0].server.as_deref(), Some("fs"));
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn rate_limited_third_call_returns_retry_after() {
        let mut config = Config::default();
        config.quotas.insert(
            "developer".into(),
            crate::audit::rate_limit::Quota {
                limits: crate::audit::rate_limit::QuotaLimits {
                    max_calls_per_minute: Some(2),
                    ..Default::default()
                },
                per_tool: HashMap::new(),
            },
        );
        let router = build_router(config).await;
        router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();

        let call = json!({"name": "fs__read", "arguments": {}});
        for _ in 0..2 {
            let value = router
                .route_request("S1", "tools/call", Some(call.clone()), &cancel())
                .await
                .unwrap();
            assert_eq!(value["isError"], false);
        }
        let value = router
            .route_request("S1", "tools/call", Some(call.clone()), &cancel())
            .await
            .unwrap();
        assert_eq!(value["isError"], true);
        assert!(value["metadata"]["retryAfterMs"].as_u64().unwrap() > 0);
        let text = value["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("per minute"));

        // A different session still has budget.
        let value = router
            .route_request("S2", "tools/call", Some(call), &cancel())
            .await
            .unwrap();
        assert_eq!(value["isError"], false);
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn set_role_via_tool_call_switches_and_notifies() {
        let router = build_router(Config::default()).await;
        let notified = Arc::new(StdMutex::new(Vec::<(Vec<String>, Vec<String>)>::new()));
        {
            let notified = Arc::clone(&notified);
            router.set_tools_changed_callback(Box::new(move |added, removed| {
                notified
                    .lock()
                    .unwrap()
                    .push((added.to_vec(), removed.to_vec()));
                Ok(())
            }));
        }

        let value = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "set_role", "arguments": {"role": "admin"}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(value["isError"], false);
        let manifest_text = value["content"][0]["text"].as_str().unwrap();
        assert!(manifest_text.contains("\"id\": \"admin\""));

        let calls = notified.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains(&"web__fetch".to_string()));

        router.stop_servers().await;
    }

    #[tokio::test]
    async fn switching_roles_diffs_the_table() {
        let router = build_router(Config::default()).await;
        router
            .set_role(SetRoleOptions {
                role: "admin".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();

        let notified = Arc::new(StdMutex::new(Vec::<(Vec<String>, Vec<String>)>::new()));
        {
            let notified = Arc::clone(&notified);
            router.set_tools_changed_callback(Box::new(move |added, removed| {
                notified
                    .lock()
                    .unwrap()
                    .push((added.to_vec(), removed.to_vec()));
                Ok(())
            }));
        }

        let manifest = router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();
        assert!(manifest.metadata.tools_changed);

        let calls = notified.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (added, removed) = &calls[0];
        assert!(added.is_empty());
        assert!(removed.contains(&"web__fetch".to_string()));
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn failing_callback_does_not_fail_set_role() {
        let router = build_router(Config::default()).await;
        router.set_tools_changed_callback(Box::new(|_, _| {
            anyhow::bail!("notification channel broken")
        }));
        let manifest = router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();
        assert_eq!(manifest.role.id, "developer");
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn get_agent_manifest_reflects_current_role() {
        let router = build_router(Config::default()).await;
        let result = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "get_agent_manifest", "arguments": {}})),
                &cancel(),
            )
            .await
            .unwrap();
        // No role active yet.
        assert_eq!(result["isError"], true);

        router
            .set_role(SetRoleOptions {
                role: "admin".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();
        let result = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "get_agent_manifest", "arguments": {}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("\"id\": \"admin\""));
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn list_roles_tool_marks_current() {
        let router = build_router(Config::default()).await;
        router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();
        let result = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "list_roles", "arguments": {}})),
                &cancel(),
            )
            .await
            .unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let listed: Vec<Value> = serde_json::from_str(text).unwrap();
        let dev = listed
            .iter()
            .find(|r| r["id"] == "developer")
            .unwrap();
        assert_eq!(dev["isCurrent"], true);
        router.stop_servers().await;
    }

    #[tokio::test]
    async fn skill_allowlist_gates_get_skill() {
        let mut config = Config::default();
        config.roles.insert(
            "developer".into(),
            RoleOverlay {
                allowed_skills: Some(vec!["filesystem".into()]),
                tool_permissions: Some(ToolPermissions {
                    allow_patterns: vec!["fs__*".into(), "catalog__*".into()],
                    ..Default::default()
                }),
                allowed_servers: Some(vec!["fs".into(), "catalog".into()]),
                ..Default::default()
            },
        );

        let (tx, _rx) = events::channel();
        let pool = Arc::new(UpstreamPool::new(tx.clone(), Duration::from_secs(5)));
        pool.add_server("fs", upstream(&["read"])).await;
        pool.add_server("catalog", upstream(&["get_skill", "list_skills"]))
            .await;
        pool.start_all().await;

        let router = Arc::new(RouterCore::new(config, pool, tx));
        router
            .initialize_with(
                SkillManifest::parse(MANIFEST).unwrap(),
                IdentityConfig::default(),
            )
            .await
            .unwrap();
        router
            .set_role(SetRoleOptions {
                role: "developer".into(),
                include_descriptions: false,
            })
            .await
            .unwrap();

        // Denied without touching the upstream.
        let result = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "catalog__get_skill", "arguments": {"id": "web_access"}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], true);

        // Allowed skill goes through.
        let result = router
            .route_request(
                "s1",
                "tools/call",
                Some(json!({"name": "catalog__get_skill", "arguments": {"id": "filesystem"}})),
                &cancel(),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        router.stop_servers().await;
    }

    #[test]
    fn skill_listing_filter_keeps_allowed_ids() {
        let result = ToolCallResult::text(
            r#"[{"id": "filesystem"}, {"id": "web_access"}, {"noid": true}]"#,
        );
        let filtered = filter_skill_listing(result, &["filesystem".to_string()]);
        match &filtered.content[0] {
            crate::rpc::ContentBlock::Text { text } => {
                let items: Vec<Value> = serde_json::from_str(text).unwrap();
                assert_eq!(items.len(), 1);
                assert_eq!(items[0]["id"], "filesystem");
            }
            other => panic!("unexpected content {:?}", other),
        }
    }
}
