#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("session error: {0}")]
    Session(String),
    #[error("context error: {0}")]
    Context(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl InferenceError {
    /// Rate limits, server errors and network failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Request(_) => true,
            InferenceError::ApiError { status, .. } => *status == 429 || *status >= 500,
            InferenceError::Parse(_) => false,
        }
    }
}

/// Rejections from registering or unregistering a tool.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid tool: {0}")]
    InvalidTool(String),
    #[error("tool already registered: {0}")]
    Duplicate(String),
    #[error("tool {tool} depends on unregistered tool {dependency}")]
    UnresolvedDependency { tool: String, dependency: String },
    #[error("tool {tool} is required by: {}", dependents.join(", "))]
    HasDependents { tool: String, dependents: Vec<String> },
    #[error("tool not found: {0}")]
    NotFound(String),
}

/// Failure to run a tool. Every variant is fed back to the model as a
/// failed tool result; none of them abort the turn.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool {0} is disabled")]
    Disabled(String),
    #[error("tool {tool} requires {permission} permission")]
    PermissionDenied { tool: String, permission: String },
    #[error("tool {tool} depends on {dependency}, which is unavailable")]
    DependencyUnavailable { tool: String, dependency: String },
    #[error("tool {tool} failed (execution {execution_id}): {cause}")]
    Execution {
        tool: String,
        execution_id: String,
        cause: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepairError {
    #[error("no JSON object found")]
    NoObject,
    #[error("could not repair JSON near: {excerpt}")]
    Unrepairable { excerpt: String },
}
