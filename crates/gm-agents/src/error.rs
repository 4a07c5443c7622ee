#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid agent invocation: {message}")]
    InvalidInvocation { message: String },
    #[error("failed to spawn agent process: {message}")]
    Spawn { message: String },
    #[error("agent runtime error: {message}")]
    Runtime { message: String },
}

/// Reject invocations that would spawn a process with nothing to do or no
/// way to ever stop.
pub fn validate_invocation(
    invocation: &crate::types::AgentInvocation,
) -> Result<(), AgentError> {
    if invocation.timeout_secs == 0 {
        return Err(AgentError::InvalidInvocation {
            message: "timeout_secs must be greater than zero".to_string(),
        });
    }
    if invocation.prompt.trim().is_empty() {
        return Err(AgentError::InvalidInvocation {
            message: "prompt must not be empty".to_string(),
        });
    }
    Ok(())
}
