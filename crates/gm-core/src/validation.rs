//! Validation for launch requests and configuration.

use serde::{Deserialize, Serialize};

use crate::config::GmConfig;
use crate::types::LaunchRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for LaunchRequest {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.project_name.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "launch.project_name.empty",
                message: "project_name must not be empty".to_string(),
            });
        }

        if !self.repo_path.is_absolute() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "launch.repo_path.relative",
                message: format!(
                    "repo_path must be absolute, got {}",
                    self.repo_path.display()
                ),
            });
        }

        if self.agents.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "launch.agents.empty",
                message: "at least one agent must be configured".to_string(),
            });
        }

        for (index, agent) in self.agents.iter().enumerate() {
            if agent.team.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "launch.agent.team.empty",
                    message: format!("agent #{index} has an empty team name"),
                });
            }
            if agent.task.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "launch.agent.task.empty",
                    message: format!("agent #{index} has an empty task description"),
                });
            }
        }

        if self.build_command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "launch.build_command.blank",
                message: "build_command is blank; the build phase will be skipped".to_string(),
            });
        }

        if self.test_command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "launch.test_command.blank",
                message: "test_command is blank; the test phase will be skipped".to_string(),
            });
        }

        issues
    }
}

impl Validate for GmConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.worktree.branch_prefix.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worktree.branch_prefix.empty",
                message: "worktree branch_prefix must not be empty".to_string(),
            });
        }

        if self.worktree.subdir.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worktree.subdir.empty",
                message: "worktree subdir must not be empty".to_string(),
            });
        }

        if self.hub.queue_capacity == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "hub.queue_capacity.zero",
                message: "hub queue_capacity must be greater than zero".to_string(),
            });
        }

        if self.launcher.resource_error_threshold == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "launcher.resource_error_threshold.zero",
                message: "resource_error_threshold must be greater than zero".to_string(),
            });
        }

        for (name, team) in &self.teams {
            if team.teammates.is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "teams.teammates.empty",
                    message: format!("team '{name}' declares no teammates"),
                });
            }
            for teammate in &team.teammates {
                if teammate.timeout_seconds == 0 {
                    issues.push(ValidationIssue {
                        level: ValidationLevel::Error,
                        code: "teams.teammate.timeout.zero",
                        message: format!(
                            "teammate '{}' in team '{name}' has a zero timeout",
                            teammate.name
                        ),
                    });
                }
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::{Validate, ValidationLevel};
    use crate::config::parse_config;
    use crate::types::{AgentSpec, LaunchRequest};
    use std::path::PathBuf;

    fn valid_request() -> LaunchRequest {
        LaunchRequest {
            project_name: "refactor".to_string(),
            repo_path: PathBuf::from("/tmp/repo"),
            build_command: Some("cargo build".to_string()),
            test_command: Some("cargo test".to_string()),
            agents: vec![AgentSpec {
                team: "backend".to_string(),
                task: "split the parser".to_string(),
            }],
        }
    }

    #[test]
    fn valid_request_has_no_issues() {
        assert!(valid_request().validate().is_empty());
    }

    #[test]
    fn relative_repo_path_is_an_error() {
        let mut request = valid_request();
        request.repo_path = PathBuf::from("relative/repo");
        let issues = request.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.code == "launch.repo_path.relative"
                && issue.level == ValidationLevel::Error));
    }

    #[test]
    fn empty_agent_list_is_an_error() {
        let mut request = valid_request();
        request.agents.clear();
        let issues = request.validate();
        assert!(issues.iter().any(|issue| issue.code == "launch.agents.empty"));
    }

    #[test]
    fn blank_commands_are_warnings() {
        let mut request = valid_request();
        request.build_command = Some("  ".to_string());
        request.test_command = Some(String::new());
        let issues = request.validate();
        assert_eq!(
            issues
                .iter()
                .filter(|issue| issue.level == ValidationLevel::Warning)
                .count(),
            2
        );
    }

    #[test]
    fn config_validation_flags_zero_timeout_teammate() {
        let config = parse_config(
            r#"
[teams.backend]
teammates = [{ name = "api", timeout_seconds = 0 }]
"#,
        )
        .expect("parse");
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.code == "teams.teammate.timeout.zero"));
    }

    #[test]
    fn config_validation_accepts_defaults() {
        let config = parse_config("").expect("parse");
        assert!(config.validate().is_empty());
    }
}
