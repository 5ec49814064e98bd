//! Project configuration and scenario loading.
//!
//! A project is any directory containing `.kest/config.yaml`. The
//! document names the environments a flow can run against and which
//! one is active; the selection is resolved once into an
//! [`Environment`] and handed to the runner inside a `RunContext`.

use crate::error::EnvironmentError;
use crate::graph;
use crate::markdown_parser;
use crate::model::{Environment, Scenario};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_DIR: &str = ".kest";
pub const CONFIG_FILE: &str = "config.yaml";
pub const LOG_DIR: &str = "logs";
pub const HISTORY_DB: &str = "history.db";

/// `.kest/config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_env: Option<String>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_jobs() -> usize {
    4
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            jobs: default_jobs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl KestConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: KestConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Names of the defined environments, sorted.
    pub fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Resolve a named environment.
    pub fn environment(&self, name: &str) -> Result<Environment, EnvironmentError> {
        let env = self
            .environments
            .get(name)
            .ok_or_else(|| EnvironmentError::Unknown {
                name: name.to_string(),
                known: self.environment_names(),
            })?;
        Ok(Environment {
            name: name.to_string(),
            base_url: env.base_url.clone(),
            variables: env.variables.clone(),
            headers: env.headers.clone(),
            is_active: self.active_env.as_deref() == Some(name),
        })
    }

    /// The environment a run should use: `selected` if given, otherwise
    /// `active_env`, otherwise the only environment defined.
    pub fn active_environment(&self, selected: Option<&str>) -> Result<Environment, EnvironmentError> {
        match selected.or(self.active_env.as_deref()) {
            Some(name) => self.environment(name),
            None if self.environments.len() == 1 => {
                let name = self.environment_names().remove(0);
                self.environment(&name)
            }
            None => Err(EnvironmentError::NoneSelected),
        }
    }

    /// Check that `active_env`, if set, names a defined environment.
    pub fn validate(&self) -> Result<(), EnvironmentError> {
        match &self.active_env {
            Some(name) => self.environment(name).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Make `name` the active environment.
    pub fn use_environment(&mut self, name: &str) -> Result<(), EnvironmentError> {
        self.environment(name)?;
        self.active_env = Some(name.to_string());
        Ok(())
    }
}

/// Walk up from `start` looking for `.kest/config.yaml`.
pub fn discover(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

/// Project root for a discovered config path (the directory holding
/// `.kest/`).
pub fn project_root(config_path: &Path) -> Option<PathBuf> {
    config_path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
}

/// `$KEST_HOME`, or `~/.kest`.
pub fn kest_home() -> PathBuf {
    if let Some(home) = std::env::var_os("KEST_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(CONFIG_DIR))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
}

/// How a scenario file is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioFormat {
    Script,
    Graph,
}

/// Format for an explicitly named file. Any `.md` file is a script.
pub fn scenario_format(path: &Path) -> Option<ScenarioFormat> {
    let name = path.file_name()?.to_str()?;
    if is_graph_file(name) {
        Some(ScenarioFormat::Graph)
    } else if name.ends_with(".md") || name.ends_with(".flow") {
        Some(ScenarioFormat::Script)
    } else {
        None
    }
}

fn is_graph_file(name: &str) -> bool {
    [".graph.yaml", ".graph.yml", ".graph.json"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Return `true` if a directory scan should pick up this file
/// (`.flow.md`, `.flow` or `.graph.{yaml,yml,json}`). Plain `.md`
/// files are documentation and are left alone.
fn is_scenario_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".flow.md") || n.ends_with(".flow") || is_graph_file(n))
}

/// Stem used as the script name when it has no `# ` title.
fn name_hint(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".flow.md")
        .or_else(|| name.strip_suffix(".md"))
        .or_else(|| name.strip_suffix(".flow"))
        .unwrap_or(name);
    Some(stem.to_string())
}

/// Load a single scenario file.
///
/// Dispatches to [`markdown_parser::parse_script`] for `.md` / `.flow`
/// files and to [`graph::parse_graph`] for `.graph.yaml` /
/// `.graph.yml` / `.graph.json` files.
pub fn load_scenario<P: AsRef<Path>>(path: P) -> Result<Scenario> {
    let path = path.as_ref();
    info!("Loading scenario from {}", path.display());

    let format = scenario_format(path)
        .with_context(|| format!("Unrecognised scenario file: {}", path.display()))?;
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;

    let mut scenario = match format {
        ScenarioFormat::Script => {
            let hint = name_hint(path);
            markdown_parser::parse_script(&content, hint.as_deref())
                .with_context(|| format!("Failed to parse flow {}", path.display()))?
        }
        ScenarioFormat::Graph => graph::parse_graph(&content)
            .with_context(|| format!("Failed to parse graph {}", path.display()))?,
    };
    scenario.source = Some(path.to_path_buf());

    debug!("Loaded scenario: {} ({} steps)", scenario.name, scenario.steps().len());
    Ok(scenario)
}

/// Load every scenario in `dir`, sorted by file name. A file that
/// fails to parse fails the whole load: a malformed scenario must
/// never be silently skipped.
pub fn load_scenarios_from_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<Scenario>> {
    let dir = dir.as_ref();
    info!("Loading scenarios from directory: {}", dir.display());

    let mut paths = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_scenario_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let scenarios = paths
        .iter()
        .map(load_scenario)
        .collect::<Result<Vec<_>>>()?;
    info!("Loaded {} scenarios from {}", scenarios.len(), dir.display());
    Ok(scenarios)
}

/// A file loads as one scenario; a directory loads every scenario in it.
pub fn load_path<P: AsRef<Path>>(path: P) -> Result<Vec<Scenario>> {
    let path = path.as_ref();
    if path.is_dir() {
        load_scenarios_from_dir(path)
    } else {
        Ok(vec![load_scenario(path)?])
    }
}
