// Operator subcommands. These run before tracing is initialized and
// print to the terminal directly, so they stay usable in scripts.

use crate::config::Config;
use crate::identity::IdentityConfig;
use crate::roles::{ListRolesOptions, RoleManager};
use crate::skills::SkillManifest;
use anyhow::{bail, Result};

/// `toolgate roles`: print the role catalogue derived from the skill
/// manifest plus any configured overlays.
pub fn roles_cmd(config: &Config, include_inactive: bool) -> Result<()> {
    let Some(path) = &config.gateway.skill_manifest else {
        bail!("no skill manifest configured (set gateway.skill_manifest or TOOLGATE_SKILL_MANIFEST)");
    };
    let manifest = SkillManifest::load(path)?;

    let mut manager = RoleManager::new();
    manager.load_from_skill_manifest(&manifest);
    manager.apply_overlays(&config.roles);

    let roles = manager.list_roles(ListRolesOptions { include_inactive }, None);
    if roles.is_empty() {
        println!("No roles derived from {} skills.", manifest.skills.len());
        return Ok(());
    }

    println!(
        "{} roles (manifest v{}, {} skills):",
        roles.len(),
        manifest.version,
        manifest.skills.len()
    );
    for summary in roles {
        let role = manager.get_role(&summary.id).expect("listed role exists");
        let servers = if role.allows_all_servers() {
            "*".to_string()
        } else {
            role.allowed_servers.join(", ")
        };
        println!(
            "  {:<16} active={:<5} skills={:<2} servers=[{}]",
            summary.id, summary.active, summary.skill_count, servers
        );
    }
    Ok(())
}

/// `toolgate check`: validate every configuration surface in strict
/// mode and report problems. Non-zero exit on fatal errors.
pub fn check_cmd(config: &Config, config_path: Option<&std::path::Path>) -> Result<()> {
    let mut problems: Vec<String> = Vec::new();

    match config_path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: (defaults)"),
    }

    // Skill manifest.
    let manifest = match &config.gateway.skill_manifest {
        Some(path) => match SkillManifest::load(path) {
            Ok(manifest) => {
                println!("skill manifest: {} skills (v{})", manifest.skills.len(), manifest.version);
                Some(manifest)
            }
            Err(e) => {
                problems.push(format!("skill manifest: {}", e));
                None
            }
        },
        None => {
            println!("skill manifest: (none configured)");
            None
        }
    };

    // Identity overlay; rule contexts are validated as strict loading
    // would.
    let identity = match &config.gateway.identity_config {
        Some(path) => match IdentityConfig::load_yaml(path) {
            Ok(identity) => {
                println!(
                    "identity config: defaultRole='{}' rules={} rejectUnknown={}",
                    identity.default_role,
                    identity.skill_rules.len(),
                    identity.reject_unknown
                );
                Some(identity)
            }
            Err(e) => {
                problems.push(format!("identity config: {}", e));
                None
            }
        },
        None => {
            println!("identity config: (defaults)");
            None
        }
    };
    if let Some(identity) = &identity {
        for rule in &identity.skill_rules {
            if let Err(e) = rule.validate() {
                problems.push(format!("identity rule for '{}': {}", rule.role, e));
            }
            if !rule.can_match() {
                problems.push(format!(
                    "identity rule for '{}' has neither requiredSkills nor anySkills and can never match",
                    rule.role
                ));
            }
        }
    }
    if let Some(manifest) = &manifest {
        for skill in &manifest.skills {
            let Some(contribution) = &skill.identity else {
                continue;
            };
            for rule in &contribution.skill_matching {
                if let Err(e) = rule.validate() {
                    problems.push(format!("skill '{}' identity rule: {}", skill.id, e));
                }
            }
        }
    }

    // Upstream table.
    match config.resolve_upstreams() {
        Ok(table) => {
            let disabled = table.values().filter(|u| u.disabled).count();
            println!("upstreams: {} configured ({} disabled)", table.len(), disabled);
            for (name, upstream) in &table {
                if upstream.command.trim().is_empty() {
                    problems.push(format!("upstream '{}' has an empty command", name));
                }
            }
        }
        Err(e) => problems.push(format!("upstream table: {}", e)),
    }

    // Derived catalogue sanity.
    if let Some(manifest) = &manifest {
        let mut manager = RoleManager::new();
        manager.load_from_skill_manifest(manifest);
        manager.apply_overlays(&config.roles);
        let roles = manager.list_roles(
            ListRolesOptions {
                include_inactive: true,
            },
            None,
        );
        println!("roles: {} derived", roles.len());
        for role_id in config.quotas.keys() {
            if !manager.has_role(role_id) {
                problems.push(format!("quota configured for unknown role '{}'", role_id));
            }
        }
    }

    if problems.is_empty() {
        println!("ok");
        Ok(())
    } else {
        for p in &problems {
            println!("problem: {}", p);
        }
        bail!("{} problem(s) found", problems.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn check_passes_on_valid_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_file(
            dir.path(),
            "skills.json",
            r#"{"version": "1", "skills": [{"id": "fs", "allowedRoles": ["dev"], "allowedTools": ["fs__read"]}]}"#,
        );
        let identity = write_file(
            dir.path(),
            "identity.yaml",
            "version: '1'\ndefaultRole: dev\nskillRules:\n  - role: dev\n    anySkills: [coding]\n",
        );

        let mut config = Config::default();
        config.gateway.skill_manifest = Some(manifest);
        config.gateway.identity_config = Some(identity);
        assert!(check_cmd(&config, None).is_ok());
    }

    #[test]
    fn check_flags_bad_rules_and_unknown_quota_roles() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_file(
            dir.path(),
            "skills.json",
            r#"{"version": "1", "skills": [{"id": "fs", "allowedRoles": ["dev"], "allowedTools": ["fs__read"]}]}"#,
        );
        let identity = write_file(
            dir.path(),
            "identity.yaml",
            concat!(
                "version: '1'\n",
                "defaultRole: dev\n",
                "skillRules:\n",
                "  - role: night\n",
                "    anySkills: [oncall]\n",
                "    context:\n",
                "      allowedTime: \"whenever\"\n",
                "  - role: empty\n",
            ),
        );

        let mut config = Config::default();
        config.gateway.skill_manifest = Some(manifest);
        config.gateway.identity_config = Some(identity);
        config
            .quotas
            .insert("ghost".into(), Default::default());

        let err = check_cmd(&config, None).unwrap_err();
        assert!(err.to_string().contains("problem"));
    }

    #[test]
    fn roles_cmd_requires_manifest() {
        let config = Config::default();
        assert!(roles_cmd(&config, false).is_err());
    }
}
