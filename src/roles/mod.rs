pub mod pattern;

use crate::skills::SkillManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Tools the router itself answers; they pass every access check so a
/// client can always inspect and switch roles.
pub const SYSTEM_TOOLS: &[&str] = &["set_role", "get_agent_manifest", "list_roles"];

pub fn is_system_tool(tool: &str) -> bool {
    SYSTEM_TOOLS.contains(&tool)
}

// ---------------------------------------------------------------------------
// Role model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermissions {
    /// Exact tool names, checked before patterns.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    /// `*`/`?` glob patterns.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

impl ToolPermissions {
    fn declares_allow_scope(&self) -> bool {
        !self.allow.is_empty() || !self.allow_patterns.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.allow.is_empty()
            && self.deny.is_empty()
            && self.allow_patterns.is_empty()
            && self.deny_patterns.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleMetadata {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub skills: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl Default for RoleMetadata {
    fn default() -> Self {
        Self {
            priority: 0,
            tags: Vec::new(),
            active: true,
            skills: Vec::new(),
        }
    }
}

/// Reference to a remotely hosted system instruction; fetched through the
/// TTL-gated cache on role activation, with `fallback` used on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInstruction {
    pub url: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Upstream names this role may reach; `"*"` admits all.
    #[serde(default)]
    pub allowed_servers: Vec<String>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub remote_instruction: Option<RemoteInstruction>,
    #[serde(default)]
    pub tool_permissions: Option<ToolPermissions>,
    #[serde(default)]
    pub metadata: RoleMetadata,
}

impl Role {
    pub fn allows_all_servers(&self) -> bool {
        self.allowed_servers.iter().any(|s| s == "*")
    }
}

/// Per-role overlay from the gateway config: operators can tighten
/// permissions or attach instructions on top of the derived catalogue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOverlay {
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub remote_instruction: Option<RemoteInstruction>,
    #[serde(default)]
    pub tool_permissions: Option<ToolPermissions>,
    #[serde(default)]
    pub allowed_servers: Option<Vec<String>>,
    #[serde(default)]
    pub active: Option<bool>,
    /// Restrict which skill-catalogue entries `list_skills`/`get_skill`
    /// may surface under this role.
    #[serde(default)]
    pub allowed_skills: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub is_current: bool,
    pub skill_count: usize,
    pub server_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListRolesOptions {
    pub include_inactive: bool,
}

// ---------------------------------------------------------------------------
// Role manager
// ---------------------------------------------------------------------------

/// Derives the role catalogue from a skill manifest and answers
/// access-check queries. The catalogue is replaced atomically on reload.
#[derive(Default)]
pub struct RoleManager {
    roles: BTreeMap<String, Role>,
    /// Role id -> skill-catalogue allow-list (from overlays).
    skill_allowlists: BTreeMap<String, Vec<String>>,
}

/// Accumulator used during derivation; keeps insertion order for skills
/// and tool patterns.
#[derive(Default)]
struct RoleAccum {
    skills: Vec<String>,
    tools: Vec<String>,
}

impl RoleAccum {
    fn add(&mut self, skill_id: &str, tools: &[String]) {
        if !self.skills.iter().any(|s| s == skill_id) {
            self.skills.push(skill_id.to_string());
        }
        for t in tools {
            if !self.tools.iter().any(|x| x == t) {
                self.tools.push(t.clone());
            }
        }
    }
}

const ALL_ROLES_BUCKET: &str = "__all__";

impl RoleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the catalogue from a skill manifest. Skills listing `"*"`
    /// in `allowedRoles` contribute to every derived role.
    pub fn load_from_skill_manifest(&mut self, manifest: &SkillManifest) {
        let mut buckets: BTreeMap<String, RoleAccum> = BTreeMap::new();

        for skill in &manifest.skills {
            for role_id in &skill.allowed_roles {
                let key = if role_id == "*" {
                    ALL_ROLES_BUCKET.to_string()
                } else {
                    role_id.clone()
                };
                buckets
                    .entry(key)
                    .or_default()
                    .add(&skill.id, &skill.allowed_tools);
            }
        }

        let wildcard = buckets.remove(ALL_ROLES_BUCKET);
        if let Some(all) = &wildcard {
            for accum in buckets.values_mut() {
                for s in &all.skills {
                    if !accum.skills.iter().any(|x| x == s) {
                        accum.skills.push(s.clone());
                    }
                }
                for t in &all.tools {
                    if !accum.tools.iter().any(|x| x == t) {
                        accum.tools.push(t.clone());
                    }
                }
            }
        }

        let mut roles = BTreeMap::new();
        for (id, accum) in buckets {
            let allowed_servers = derive_servers(&accum.tools);
            let tool_permissions = if accum.tools.is_empty() {
                None
            } else {
                Some(ToolPermissions {
                    allow_patterns: accum.tools.clone(),
                    ..Default::default()
                })
            };
            let instruction = synthesize_instruction(&id, &accum.skills);
            let role = Role {
                name: id.clone(),
                description: format!("Derived from {} skill(s)", accum.skills.len()),
                allowed_servers,
                instruction,
                remote_instruction: None,
                tool_permissions,
                metadata: RoleMetadata {
                    priority: 0,
                    tags: vec!["dynamic".into(), "skill-driven".into()],
                    active: true,
                    skills: accum.skills,
                },
                id: id.clone(),
            };
            roles.insert(id, role);
        }

        info!("Derived {} roles from skill manifest v{}", roles.len(), manifest.version);
        self.roles = roles;
        self.skill_allowlists.clear();
    }

    /// Apply operator overlays on top of the derived catalogue. Unknown
    /// role ids create inactive-by-default entries so operators can
    /// define roles the manifest does not mention.
    pub fn apply_overlays(&mut self, overlays: &BTreeMap<String, RoleOverlay>) {
        for (id, overlay) in overlays {
            let role = self.roles.entry(id.clone()).or_insert_with(|| Role {
                id: id.clone(),
                name: id.clone(),
                description: "Configured role".into(),
                allowed_servers: Vec::new(),
                instruction: String::new(),
                remote_instruction: None,
                tool_permissions: None,
                metadata: RoleMetadata::default(),
            });
            if let Some(instruction) = &overlay.instruction {
                role.instruction = instruction.clone();
            }
            if let Some(remote) = &overlay.remote_instruction {
                role.remote_instruction = Some(remote.clone());
            }
            if let Some(perms) = &overlay.tool_permissions {
                if perms.is_empty() {
                    role.tool_permissions = None;
                } else {
                    role.tool_permissions = Some(perms.clone());
                }
            }
            if let Some(servers) = &overlay.allowed_servers {
                role.allowed_servers = servers.clone();
            }
            if let Some(active) = overlay.active {
                role.metadata.active = active;
            }
            if let Some(skills) = &overlay.allowed_skills {
                self.skill_allowlists.insert(id.clone(), skills.clone());
            }
            debug!("Applied overlay to role '{}'", id);
        }
    }

    pub fn get_role(&self, id: &str) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn has_role(&self, id: &str) -> bool {
        self.roles.contains_key(id)
    }

    pub fn role_ids(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    pub fn list_roles(&self, opts: ListRolesOptions, current: Option<&str>) -> Vec<RoleSummary> {
        self.roles
            .values()
            .filter(|r| opts.include_inactive || r.metadata.active)
            .map(|r| RoleSummary {
                id: r.id.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
                active: r.metadata.active,
                is_current: current == Some(r.id.as_str()),
                skill_count: r.metadata.skills.len(),
                server_count: r.allowed_servers.len(),
            })
            .collect()
    }

    #[allow(dead_code)]
    pub fn get_skills_for_role(&self, role_id: &str) -> Vec<String> {
        self.roles
            .get(role_id)
            .map(|r| r.metadata.skills.clone())
            .unwrap_or_default()
    }

    /// The skill-catalogue allow-list for a role, when one is declared.
    pub fn skill_allowlist(&self, role_id: &str) -> Option<&[String]> {
        self.skill_allowlists.get(role_id).map(|v| v.as_slice())
    }

    pub fn is_server_allowed_for_role(&self, role: &Role, server: &str) -> bool {
        role.allows_all_servers() || role.allowed_servers.iter().any(|s| s == server)
    }

    /// Full access check for tool `tool` on `server` under `role`.
    /// System tools always pass; otherwise the server gate runs first,
    /// then tool permissions in deny, deny-patterns, allow,
    /// allow-patterns order. Declaring any allow scope flips the default
    /// to deny.
    pub fn is_tool_allowed_for_role(&self, role: &Role, tool: &str, server: &str) -> bool {
        if is_system_tool(tool) {
            return true;
        }
        if !self.is_server_allowed_for_role(role, server) {
            return false;
        }

        let Some(perms) = &role.tool_permissions else {
            return true;
        };

        if perms.deny.iter().any(|t| t == tool) {
            return false;
        }
        if pattern::any_match(&perms.deny_patterns, tool) {
            return false;
        }
        if perms.allow.iter().any(|t| t == tool) {
            return true;
        }
        if pattern::any_match(&perms.allow_patterns, tool) {
            return true;
        }

        !perms.declares_allow_scope()
    }
}

/// Pull upstream names out of tool patterns. Two shapes are recognized:
/// `mcp__plugin_<p>_<server>__<tool>` and `<server>__<tool>`; anything
/// else contributes no server.
fn derive_servers(patterns: &[String]) -> Vec<String> {
    let mut servers: Vec<String> = Vec::new();
    for pattern in patterns {
        let server = if let Some(rest) = pattern.strip_prefix("mcp__plugin_") {
            rest.split("__")
                .next()
                .and_then(|seg| seg.split_once('_'))
                .map(|(_, server)| server.to_string())
        } else if pattern.contains("__") {
            pattern.split("__").next().map(|s| s.to_string())
        } else {
            None
        };
        if let Some(server) = server {
            if !server.is_empty() && !servers.iter().any(|s| s == &server) {
                servers.push(server);
            }
        }
    }
    servers
}

fn synthesize_instruction(role_id: &str, skills: &[String]) -> String {
    if skills.is_empty() {
        format!("You are operating in the '{}' role.", role_id)
    } else {
        format!(
            "You are operating in the '{}' role. Skills available to you: {}.",
            role_id,
            skills.join(", ")
        )
    }
}
