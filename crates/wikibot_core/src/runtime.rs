use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".wikibot";
pub const PROJECTS_DIR_NAME: &str = "projects";
pub const DB_FILENAME: &str = "wikibot.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub projects_dir: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})\nprojects_dir={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.projects_dir),
        )
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);

    let state_dir = project_root.join(STATE_DIR_NAME);
    let projects_dir = project_root.join(PROJECTS_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WIKIBOT_DATA_DIR")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("WIKIBOT_CONFIG")) {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        projects_dir,
        root_source,
        data_source,
        config_source,
    })
}

/// Create the state, data and projects directories and write a starter config.
pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir, &paths.projects_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, &render_materialized_config(), force)?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    "# wikibot configuration (materialized by `wikibot init`)\n\n[bot]\n# Project file name under projects/ (without .toml); WIKIBOT_PROJECT overrides.\n# project = \"wikipedia\"\n# user_agent = \"wikibot/0.2\"\n# summary = \"Bot: updating interwiki links\"\n".to_string()
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_empty(lookup_env("WIKIBOT_PROJECT_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    match detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref()) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        candidates.extend(ancestors(exe_dir));
    }
    candidates.into_iter().find(|candidate| {
        seen.insert(normalize_for_display(candidate))
            && (candidate.join(STATE_DIR_NAME).is_dir() || candidate.join(PROJECTS_DIR_NAME).is_dir())
    })
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, init_layout, resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };

        let env = HashMap::from([(
            "WIKIBOT_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.state_dir, from_flag.join(".wikibot"));
        assert_eq!(
            resolved.db_path,
            from_flag.join(".wikibot").join("data").join("wikibot.db")
        );
    }

    #[test]
    fn resolve_paths_detects_root_from_projects_dir() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("bot");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join("projects")).expect("projects dir");
        fs::create_dir_all(&nested).expect("nested dir");

        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn resolve_paths_reads_data_dir_and_config_from_env() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([
            ("WIKIBOT_DATA_DIR".to_string(), "state".to_string()),
            ("WIKIBOT_CONFIG".to_string(), "custom.toml".to_string()),
        ]);
        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve");
        assert_eq!(resolved.data_dir, root.join("state"));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.config_path, root.join("custom.toml"));
        assert_eq!(resolved.config_source, ValueSource::Env);
    }

    #[test]
    fn init_layout_creates_dirs_and_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, false).expect("init");
        assert_eq!(report.created_dirs.len(), 3);
        assert!(report.wrote_config);
        assert!(paths.projects_dir.exists());
        assert!(paths.data_dir.exists());

        fs::write(&paths.config_path, "[bot]\nproject = \"kept\"\n").expect("edit config");
        let second = init_layout(&paths, false).expect("init again");
        assert!(second.created_dirs.is_empty());
        assert!(!second.wrote_config);
        let content = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(content.contains("kept"));
    }
}
