//! Command construction for the agent CLI plus the fixed prompt templates
//! the pipeline feeds it.

use crate::types::{AgentCommand, AgentInvocation};

/// Environment variable the agent CLI recognises to enable team sessions.
pub const AGENT_TEAMS_ENV: (&str, &str) = ("CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS", "1");

pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn build_command(&self, invocation: &AgentInvocation) -> AgentCommand;
}

/// The `claude` CLI in non-interactive print mode with a fixed tool
/// allowlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeBackend {
    pub executable: String,
    pub allowed_tools: String,
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            allowed_tools: "Edit,Write,Bash,Read,Glob,Grep".to_string(),
        }
    }
}

impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(&self, invocation: &AgentInvocation) -> AgentCommand {
        AgentCommand {
            executable: self.executable.clone(),
            args: vec![
                "--allowedTools".to_string(),
                self.allowed_tools.clone(),
                "-p".to_string(),
                invocation.prompt.clone(),
            ],
            env: invocation.env.clone(),
        }
    }
}

/// Prompt for a team session working inside its own worktree.
pub fn team_prompt(team_name: &str, task: &str) -> String {
    format!("Team: {team_name}\nTask: {task}")
}

/// Prompt for resolving merge conflicts left in the main checkout.
pub fn conflict_prompt(conflicted_files: &[String]) -> String {
    format!(
        "There are merge conflicts in the following files:\n{}\n\n\
         Please resolve all merge conflicts in these files. Keep the best version of each \
         conflicting section, combining changes from both sides where appropriate. \
         Remove all conflict markers (<<<<<<<, =======, >>>>>>>). \
         After resolving, stage the files with git add.",
        conflicted_files.join("\n")
    )
}

/// Prompt for repairing a failing build command.
pub fn build_fix_prompt(build_command: &str, error_output: &str) -> String {
    format!(
        "The build command `{build_command}` failed with the following errors:\n\n\
         ```\n{error_output}\n```\n\n\
         Fix the compilation errors. Only fix build/compilation issues — do not change \
         test expectations or add new features. Make minimal changes to get the build passing."
    )
}

/// Prompt for repairing failing tests.
pub fn test_fix_prompt(test_command: &str, error_output: &str) -> String {
    format!(
        "The test command `{test_command}` failed with the following output:\n\n\
         ```\n{error_output}\n```\n\n\
         Fix the implementation so the tests pass. Do NOT modify test expectations — \
         fix the actual implementation code. Make minimal changes."
    )
}
