//! TOML configuration for the daemon: tunables plus team and project
//! templates (the `orchestra` file external drivers edit by hand).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{AgentSpec, LaunchRequest, TeamTemplate, TeammateSpec};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmConfig {
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub teams: BTreeMap<String, TeamDef>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    pub subdir: String,
    pub branch_prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            subdir: ".worktrees".to_string(),
            branch_prefix: "team".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub outputs_dir: PathBuf,
    pub stop_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub resource_error_threshold: u32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            outputs_dir: PathBuf::from("outputs"),
            stop_grace_secs: 10,
            poll_interval_ms: 50,
            resource_error_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    pub max_fix_attempts: u32,
    pub command_timeout_secs: u64,
    pub repair_timeout_secs: u64,
    pub shell: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_fix_attempts: 3,
            command_timeout_secs: 300,
            repair_timeout_secs: 600,
            shell: "bash".to_string(),
        }
    }
}

/// Team body as written in config; the map key is the team name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamDef {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub teammates: Vec<TeammateSpec>,
}

/// Project template body; the map key is the project name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDef {
    #[serde(default)]
    pub description: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

impl GmConfig {
    /// Resolve a team template by name.
    pub fn team(&self, name: &str) -> Option<TeamTemplate> {
        self.teams.get(name).map(|def| TeamTemplate {
            name: name.to_string(),
            description: def.description.clone(),
            teammates: def.teammates.clone(),
        })
    }

    pub fn available_teams(&self) -> Vec<TeamTemplate> {
        self.teams
            .keys()
            .filter_map(|name| self.team(name))
            .collect()
    }

    /// Build a launch request from a configured project template.
    pub fn launch_request(&self, project_name: &str) -> Option<LaunchRequest> {
        self.projects.get(project_name).map(|def| LaunchRequest {
            project_name: project_name.to_string(),
            repo_path: def.repo_path.clone(),
            build_command: def.build_command.clone(),
            test_command: def.test_command.clone(),
            agents: def.agents.clone(),
        })
    }

    pub fn available_projects(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }
}

pub fn parse_config(contents: &str) -> Result<GmConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<GmConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

pub fn save_config(path: impl AsRef<Path>, config: &GmConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent) = path_ref.parent().map(Path::to_path_buf) {
        fs::create_dir_all(&parent).map_err(|source| ConfigError::CreateDir {
            path: parent,
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
