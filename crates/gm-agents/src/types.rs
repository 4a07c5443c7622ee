use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fully rendered command line for one agent subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// One request to run an agent: where, what, and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub repo_path: PathBuf,
    pub prompt: String,
    pub timeout_secs: u64,
    pub env: Vec<(String, String)>,
}

impl AgentInvocation {
    pub fn new(repo_path: impl Into<PathBuf>, prompt: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            repo_path: repo_path.into(),
            prompt: prompt.into(),
            timeout_secs,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}
