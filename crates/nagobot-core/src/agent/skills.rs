use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;

/// Metadata parsed from a skill's YAML front-matter.
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub always: bool,
    pub available: bool,
    pub missing_requirements: Vec<String>,
}

/// Loads markdown skills from `<workspace>/skills/<name>/SKILL.md`, with an
/// optional builtin directory that workspace skills override by name.
pub struct SkillsLoader {
    workspace_skills: PathBuf,
    builtin_skills: Option<PathBuf>,
    frontmatter_re: Regex,
}

impl SkillsLoader {
    pub fn new(workspace: &Path, builtin: Option<&Path>) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            builtin_skills: builtin.map(|p| p.to_path_buf()),
            frontmatter_re: Regex::new(r"(?s)^---\n(.*?)\n---").unwrap(),
        }
    }

    /// All skills with metadata, workspace first.
    pub fn list_skills(&self) -> Vec<SkillInfo> {
        let mut skills = Vec::new();
        let mut seen_names = std::collections::HashSet::new();

        if self.workspace_skills.exists() {
            self.scan_dir(&self.workspace_skills, &mut skills);
            for s in &skills {
                seen_names.insert(s.name.clone());
            }
        }

        if let Some(ref builtin) = self.builtin_skills {
            if builtin.exists() {
                let mut builtin_skills = Vec::new();
                self.scan_dir(builtin, &mut builtin_skills);
                for s in builtin_skills {
                    if seen_names.insert(s.name.clone()) {
                        skills.push(s);
                    }
                }
            }
        }

        skills
    }

    /// Names of available skills marked `always: true`.
    pub fn get_always_skills(&self) -> Vec<String> {
        self.list_skills()
            .into_iter()
            .filter(|s| s.always && s.available)
            .map(|s| s.name)
            .collect()
    }

    pub fn load_skill(&self, name: &str) -> Option<String> {
        let workspace_path = self.workspace_skills.join(name).join("SKILL.md");
        if workspace_path.exists() {
            return std::fs::read_to_string(&workspace_path).ok();
        }

        if let Some(ref builtin) = self.builtin_skills {
            let builtin_path = builtin.join(name).join("SKILL.md");
            if builtin_path.exists() {
                return std::fs::read_to_string(&builtin_path).ok();
            }
        }

        None
    }

    /// Full skill bodies for context injection, front-matter stripped.
    pub fn load_skills_for_context(&self, skill_names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in skill_names {
            if let Some(content) = self.load_skill(name) {
                let body = self.strip_frontmatter(&content);
                parts.push(format!("### Skill: {name}\n\n{body}"));
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// Compact XML summary of on-demand skills for the system prompt.
    /// Unavailable skills list their missing requirements so the model can
    /// ask the user to install them.
    pub fn build_skills_summary(&self) -> String {
        let skills = self.list_skills();
        if skills.is_empty() {
            return String::new();
        }

        let mut lines = vec!["<skills>".to_string()];
        for s in &skills {
            if s.always {
                continue; // already included in full
            }
            let avail = if s.available { "true" } else { "false" };
            lines.push(format!("  <skill available=\"{avail}\">"));
            lines.push(format!("    <name>{}</name>", xml_escape(&s.name)));
            lines.push(format!(
                "    <description>{}</description>",
                xml_escape(&s.description)
            ));
            lines.push(format!("    <location>{}</location>", s.path.display()));
            if !s.missing_requirements.is_empty() {
                lines.push(format!(
                    "    <requires>{}</requires>",
                    xml_escape(&s.missing_requirements.join(", "))
                ));
            }
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }

    fn scan_dir(&self, dir: &Path, out: &mut Vec<SkillInfo>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let skill_file = path.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }

            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();

            let content = match std::fs::read_to_string(&skill_file) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read skill {name}: {e}");
                    continue;
                }
            };

            let meta = self.parse_frontmatter(&content);
            let description = meta.get("description").cloned().unwrap_or_default();
            let always = meta.get("always").map(|v| v == "true").unwrap_or(false);
            let (available, missing) = check_requirements(&meta);

            out.push(SkillInfo {
                name,
                description,
                path: skill_file,
                always,
                available,
                missing_requirements: missing,
            });
        }
    }

    fn parse_frontmatter(&self, content: &str) -> HashMap<String, String> {
        let mut meta = HashMap::new();

        if let Some(caps) = self.frontmatter_re.captures(content) {
            let yaml_block = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            for line in yaml_block.lines() {
                if let Some((key, value)) = line.split_once(':') {
                    meta.insert(
                        key.trim().to_string(),
                        value.trim().trim_matches('"').trim_matches('\'').to_string(),
                    );
                }
            }
        }

        meta
    }

    fn strip_frontmatter<'a>(&self, content: &'a str) -> &'a str {
        if let Some(m) = self.frontmatter_re.find(content) {
            content[m.end()..].trim_start()
        } else {
            content
        }
    }
}

/// Probe a skill's declared requirements: binaries on PATH and environment
/// variables. Declared in front-matter `metadata` as JSON, either
/// `{"requires": {...}}` or wrapped under a `nagobot` key.
fn check_requirements(meta: &HashMap<String, String>) -> (bool, Vec<String>) {
    let mut missing = Vec::new();

    let Some(metadata_str) = meta.get("metadata") else {
        return (true, missing);
    };
    let Ok(skill_meta) = serde_json::from_str::<serde_json::Value>(metadata_str) else {
        return (true, missing);
    };

    let requires = skill_meta
        .get("requires")
        .or_else(|| skill_meta.get("nagobot").and_then(|n| n.get("requires")));
    let Some(requires) = requires else {
        return (true, missing);
    };

    if let Some(bins) = requires.get("bins").and_then(|b| b.as_array()) {
        for bin in bins.iter().filter_map(|b| b.as_str()) {
            if which::which(bin).is_err() {
                missing.push(format!("CLI: {bin}"));
            }
        }
    }

    if let Some(envs) = requires.get("env").and_then(|e| e.as_array()) {
        for env in envs.iter().filter_map(|e| e.as_str()) {
            if std::env::var(env).is_err() {
                missing.push(format!("ENV: {env}"));
            }
        }
    }

    (missing.is_empty(), missing)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
