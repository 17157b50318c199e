pub mod rules;

use crate::error::{GatewayError, GatewayResult};
use crate::skills::SkillDefinition;
use chrono::{DateTime, Utc};
use rules::{RuleOutcome, SkillMatchRule};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Agent identity
// ---------------------------------------------------------------------------

/// A capability declared by the connecting agent. Only `id` participates
/// in rule matching; the rest is carried for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDeclaration {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub io_modes: Vec<String>,
}

impl SkillDeclaration {
    #[allow(dead_code)]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            io_modes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub skills: Vec<SkillDeclaration>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentIdentity {
    #[allow(dead_code)]
    pub fn new(name: &str, skill_ids: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            skills: skill_ids.iter().map(|id| SkillDeclaration::new(*id)).collect(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Trimmed name; empty names resolve as "unknown".
    pub fn effective_name(&self) -> &str {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            "unknown"
        } else {
            trimmed
        }
    }

    pub fn skill_set(&self) -> HashSet<String> {
        self.skills.iter().map(|s| s.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResolution {
    pub role_id: String,
    pub agent_name: String,
    pub matched_rule: Option<SkillMatchRule>,
    pub matched_skills: HashSet<String>,
    pub is_trusted: bool,
    pub resolved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub version: String,
    pub default_role: String,
    #[serde(default)]
    pub skill_rules: Vec<SkillMatchRule>,
    #[serde(default)]
    pub reject_unknown: bool,
    #[serde(default)]
    pub trusted_prefixes: Vec<String>,
    #[serde(default)]
    pub strict_validation: bool,
}

impl IdentityConfig {
    /// Load the YAML overlay. Missing `version` or `defaultRole` is a
    /// load error, not a defaultable field.
    pub fn load_yaml(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot read identity config {:?}: {}", path, e))
        })?;
        Self::parse_yaml(&content)
    }

    pub fn parse_yaml(content: &str) -> GatewayResult<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            version: Option<String>,
            default_role: Option<String>,
            #[serde(default)]
            skill_rules: Vec<SkillMatchRule>,
            #[serde(default)]
            reject_unknown: bool,
            #[serde(default)]
            trusted_prefixes: Vec<String>,
            #[serde(default)]
            strict_validation: bool,
        }

        let raw: Raw = serde_yml::from_str(content)
            .map_err(|e| GatewayError::InvalidConfig(format!("bad identity config: {}", e)))?;
        let version = raw
            .version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidConfig("identity config missing version".into()))?;
        let default_role = raw
            .default_role
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidConfig("identity config missing defaultRole".into())
            })?;

        Ok(Self {
            version,
            default_role,
            skill_rules: raw.skill_rules,
            reject_unknown: raw.reject_unknown,
            trusted_prefixes: raw.trusted_prefixes,
            strict_validation: raw.strict_validation,
        })
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            version: "1".into(),
            default_role: "guest".into(),
            skill_rules: Vec::new(),
            reject_unknown: false,
            trusted_prefixes: Vec::new(),
            strict_validation: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStats {
    pub rule_count: usize,
    pub resolutions: u64,
    pub default_fallbacks: u64,
    pub rejections: u64,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Maps a declared agent identity to a role by walking skill-match rules
/// in descending priority (insertion order breaks ties).
pub struct IdentityResolver {
    config: IdentityConfig,
    stats: IdentityStats,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        let rule_count = config.skill_rules.len();
        Self {
            config,
            stats: IdentityStats {
                rule_count,
                ..Default::default()
            },
        }
    }

    #[allow(dead_code)]
    pub fn add_rule(&mut self, rule: SkillMatchRule) {
        self.config.skill_rules.push(rule);
        self.stats.rule_count = self.config.skill_rules.len();
    }

    #[allow(dead_code)]
    pub fn clear_rules(&mut self) {
        self.config.skill_rules.clear();
        self.stats.rule_count = 0;
    }

    #[allow(dead_code)]
    pub fn set_default_role(&mut self, role: impl Into<String>) {
        self.config.default_role = role.into();
    }

    #[allow(dead_code)]
    pub fn set_reject_unknown(&mut self, reject: bool) {
        self.config.reject_unknown = reject;
    }

    #[allow(dead_code)]
    pub fn rules(&self) -> &[SkillMatchRule] {
        &self.config.skill_rules
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> &IdentityStats {
        &self.stats
    }

    #[allow(dead_code)]
    pub fn has_role_rule(&self, role: &str) -> bool {
        self.config.skill_rules.iter().any(|r| r.role == role)
    }

    /// Merge rules contributed by skills. Rules whose
    /// `(role, requiredSkills, anySkills)` triple already exists (after
    /// canonical ordering) are dropped; trusted prefixes are unioned.
    pub fn load_from_skills(&mut self, skills: &[SkillDefinition]) {
        let mut seen: HashSet<String> = self
            .config
            .skill_rules
            .iter()
            .map(|r| r.dedup_key())
            .collect();
        let mut added = 0usize;

        for skill in skills {
            let Some(identity) = &skill.identity else {
                continue;
            };
            for rule in &identity.skill_matching {
                let key = rule.dedup_key();
                if !seen.insert(key) {
                    debug!("Skipping duplicate identity rule from skill '{}'", skill.id);
                    continue;
                }
                let mut rule = rule.clone();
                if rule.description.is_none() {
                    rule.description = Some(format!("from skill '{}'", skill.id));
                }
                self.config.skill_rules.push(rule);
                added += 1;
            }
            for prefix in &identity.trusted_prefixes {
                if !self
                    .config
                    .trusted_prefixes
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(prefix))
                {
                    self.config.trusted_prefixes.push(prefix.clone());
                }
            }
        }

        self.stats.rule_count = self.config.skill_rules.len();
        if added > 0 {
            info!("Loaded {} identity rules from skills", added);
        }
    }

    pub fn resolve(&mut self, identity: &AgentIdentity) -> GatewayResult<IdentityResolution> {
        self.resolve_at(identity, Utc::now())
    }

    /// Resolve with an explicit clock, used by tests and the time-window
    /// rule contexts.
    pub fn resolve_at(
        &mut self,
        identity: &AgentIdentity,
        now: DateTime<Utc>,
    ) -> GatewayResult<IdentityResolution> {
        self.stats.resolutions += 1;

        let name = identity.effective_name().to_string();
        let agent_skills = identity.skill_set();
        let is_trusted = self.is_trusted_name(&name);
        let strict = self.config.strict_validation;

        // Descending priority; stable sort keeps insertion order on ties.
        let mut ordered: Vec<&SkillMatchRule> = self.config.skill_rules.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in ordered {
            match rule.evaluate(&agent_skills, now, strict)? {
                RuleOutcome::Matched(matched_skills) => {
                    debug!(
                        "Agent '{}' matched rule for role '{}' (priority {})",
                        name, rule.role, rule.priority
                    );
                    return Ok(IdentityResolution {
                        role_id: rule.role.clone(),
                        agent_name: name,
                        matched_rule: Some(rule.clone()),
                        matched_skills,
                        is_trusted,
                        resolved_at: now,
                    });
                }
                RuleOutcome::Forbidden(skill) => {
                    debug!(
                        "Agent '{}' rejected by rule for role '{}': forbidden skill '{}'",
                        name, rule.role, skill
                    );
                }
                RuleOutcome::NotMatched => {}
            }
        }

        if self.config.reject_unknown {
            self.stats.rejections += 1;
            return Err(GatewayError::UnknownAgent { agent: name });
        }

        self.stats.default_fallbacks += 1;
        Ok(IdentityResolution {
            role_id: self.config.default_role.clone(),
            agent_name: name,
            matched_rule: None,
            matched_skills: HashSet::new(),
            is_trusted,
            resolved_at: now,
        })
    }

    fn is_trusted_name(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.config
            .trusted_prefixes
            .iter()
            .any(|p| lowered.starts_with(&p.to_lowercase()))
    }
}
