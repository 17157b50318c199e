// Skill manifest: the authoritative source for role derivation and the
// identity rules contributed by skills. The manifest is a JSON document,
// loaded once at startup and replaced atomically on reload.

use crate::error::{GatewayError, GatewayResult};
use crate::identity::rules::SkillMatchRule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillManifest {
    pub version: String,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub skills: Vec<SkillDefinition>,
}

/// One skill-catalogue entry. `allowed_roles` may contain `"*"` meaning
/// the skill contributes to every derived role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Tool-name patterns (`*`/`?` globs) this skill grants.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub identity: Option<IdentityContribution>,
    #[serde(default)]
    pub grants: Option<Value>,
}

/// A skill's contribution to the identity resolver: extra matching rules
/// and trusted name prefixes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContribution {
    #[serde(default)]
    pub skill_matching: Vec<SkillMatchRule>,
    #[serde(default)]
    pub trusted_prefixes: Vec<String>,
}

impl SkillDefinition {
    #[allow(dead_code)]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl SkillManifest {
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot read skill manifest {:?}: {}", path, e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> GatewayResult<Self> {
        let manifest: SkillManifest = serde_json::from_str(content)
            .map_err(|e| GatewayError::InvalidConfig(format!("bad skill manifest: {}", e)))?;
        if manifest.version.trim().is_empty() {
            return Err(GatewayError::InvalidConfig(
                "skill manifest missing version".into(),
            ));
        }
        Ok(manifest)
    }

    #[allow(dead_code)]
    pub fn skill(&self, id: &str) -> Option<&SkillDefinition> {
        self.skills.iter().find(|s| s.id == id)
    }
}
