use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikibot/0.2";
pub const DEFAULT_EDIT_SUMMARY: &str = "Bot: updating interwiki links";
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub bot: BotSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotSection {
    pub project: Option<String>,
    pub user_agent: Option<String>,
    pub summary: Option<String>,
}

impl BotConfig {
    /// Resolve the active project name: env WIKIBOT_PROJECT > config > None.
    pub fn project_name(&self) -> Option<String> {
        env_override("WIKIBOT_PROJECT").or_else(|| self.bot.project.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.bot.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn summary(&self) -> String {
        self.bot
            .summary
            .clone()
            .filter(|summary| !summary.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EDIT_SUMMARY.to_string())
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProjectFile {
    pub project: Project,
}

/// A family of language editions sharing one API layout.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub title: String,
    pub default_language: String,
    /// API endpoint template; `{language}` is replaced with the language code.
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_urls: BTreeMap<String, String>,
}

impl Project {
    pub fn api_url(&self, language: &str) -> Result<String> {
        if let Some(url) = self.api_urls.get(language) {
            return Ok(url.clone());
        }
        match &self.api_url {
            Some(template) if template.contains(LANGUAGE_PLACEHOLDER) => {
                Ok(template.replace(LANGUAGE_PLACEHOLDER, language))
            }
            Some(url) if self.default_language == language => Ok(url.clone()),
            _ => bail!(
                "project `{}` has no API URL for language `{language}`",
                self.name
            ),
        }
    }
}

pub fn project_path(projects_dir: &Path, name: &str) -> PathBuf {
    projects_dir.join(format!("{name}.toml"))
}

pub fn load_project(projects_dir: &Path, name: &str) -> Result<Project> {
    let path = project_path(projects_dir, name);
    if !path.exists() {
        bail!(
            "project `{name}` not found: {} does not exist (run `wikibot make:project`)",
            path.display()
        );
    }
    parse_project_file(&path)
}

fn parse_project_file(path: &Path) -> Result<Project> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: ProjectFile =
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed.project)
}

/// Every parseable project under `projects_dir`, sorted by name.
pub fn list_projects(projects_dir: &Path) -> Result<Vec<Project>> {
    if !projects_dir.exists() {
        return Ok(Vec::new());
    }
    let mut projects = Vec::new();
    let entries = fs::read_dir(projects_dir)
        .with_context(|| format!("failed to read {}", projects_dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", projects_dir.display()))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        match parse_project_file(&path) {
            Ok(project) => projects.push(project),
            Err(error) => tracing::warn!(path = %path.display(), "skipping project file: {error:#}"),
        }
    }
    projects.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(projects)
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub title: String,
    pub default_language: String,
    pub api_url: String,
}

/// Write `projects/<name>.toml`. Fails if the file already exists and `force` is not set.
pub fn create_project(projects_dir: &Path, new: &NewProject, force: bool) -> Result<PathBuf> {
    let name = new.name.trim();
    if name.is_empty() || name.contains(['/', '\\', '.']) {
        bail!("invalid project name: `{}`", new.name);
    }
    if new.default_language.trim().is_empty() {
        bail!("project default language cannot be empty");
    }

    let path = project_path(projects_dir, name);
    if path.exists() && !force {
        bail!("Project with name \"{name}\" already exists.");
    }

    let file = ProjectFile {
        project: Project {
            name: name.to_string(),
            title: new.title.trim().to_string(),
            default_language: new.default_language.trim().to_string(),
            api_url: Some(new.api_url.trim().to_string()),
            api_urls: BTreeMap::new(),
        },
    };
    let rendered = toml::to_string_pretty(&file).context("failed to serialize project TOML")?;
    fs::create_dir_all(projects_dir)
        .with_context(|| format!("failed to create {}", projects_dir.display()))?;
    fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Bot credentials from WIKI_BOT_USER / WIKI_BOT_PASS; None unless both are set.
    pub fn from_env() -> Option<Self> {
        let username = env_override("WIKI_BOT_USER")?;
        let password = env_override("WIKI_BOT_PASS")?;
        Some(Self { username, password })
    }
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
