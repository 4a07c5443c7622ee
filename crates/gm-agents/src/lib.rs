pub mod backend;
pub mod error;
pub mod process;
pub mod types;
pub mod watchdog;

pub use backend::{
    build_fix_prompt, conflict_prompt, team_prompt, test_fix_prompt, AgentBackend, ClaudeBackend,
    AGENT_TEAMS_ENV,
};
pub use error::{validate_invocation, AgentError};
pub use process::{configure_process_group, kill_group, terminate_group};
pub use types::{AgentCommand, AgentInvocation};
pub use watchdog::{
    ResourceStrike, ResourceWatchdog, DEFAULT_STRIKE_THRESHOLD, RESOURCE_ERROR_PATTERNS,
};
