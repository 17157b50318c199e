// The manifest returned by `set_role`: everything a client needs to
// reconfigure itself for the newly active role.

use crate::roles::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    pub role: ManifestRole,
    pub instruction: String,
    pub tools: Vec<ManifestTool>,
    pub servers: Vec<String>,
    pub metadata: ManifestMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRole {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub generated_at: DateTime<Utc>,
    pub tool_count: usize,
    pub server_count: usize,
    pub tools_changed: bool,
}

impl AgentManifest {
    pub fn build(
        role: &Role,
        instruction: String,
        tools: Vec<ManifestTool>,
        servers: Vec<String>,
        tools_changed: bool,
    ) -> Self {
        let tool_count = tools.len();
        let server_count = servers.len();
        Self {
            role: ManifestRole {
                id: role.id.clone(),
                name: role.name.clone(),
                description: role.description.clone(),
            },
            instruction,
            tools,
            servers,
            metadata: ManifestMetadata {
                generated_at: Utc::now(),
                tool_count,
                server_count,
                tools_changed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleMetadata;

    #[test]
    fn manifest_counts_match_contents() {
        let role = Role {
            id: "developer".into(),
            name: "developer".into(),
            description: "Dev".into(),
            allowed_servers: vec!["fs".into()],
            instruction: String::new(),
            remote_instruction: None,
            tool_permissions: None,
            metadata: RoleMetadata::default(),
        };
        let manifest = AgentManifest::build(
            &role,
            "Do dev things.".into(),
            vec![
                ManifestTool {
                    name: "fs__read".into(),
                    description: Some("Read".into()),
                },
                ManifestTool {
                    name: "set_role".into(),
                    description: None,
                },
            ],
            vec!["fs".into()],
            true,
        );
        assert_eq!(manifest.metadata.tool_count, 2);
        assert_eq!(manifest.metadata.server_count, 1);
        assert!(manifest.metadata.tools_changed);

        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["role"]["id"], "developer");
        assert_eq!(json["metadata"]["toolCount"], 2);
        // Absent descriptions are omitted, not null.
        assert!(json["tools"][1].get("description").is_none());
    }
}
