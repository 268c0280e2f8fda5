/// Top-level error type for the crewgraph engine.
///
/// Each variant corresponds to a layer that can fail. Structural problems are
/// collected and reported together so a broken graph is fixed in one pass.
#[derive(Debug, thiserror::Error)]
pub enum CrewError {
    /// The graph or crew declaration is invalid; nothing was executed.
    #[error("Structural error: {}", .0.join("; "))]
    Structural(Vec<String>),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A type tag that is not part of the registry.
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// An error originating from the agent tool loop.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error returned by the model-calling collaborator.
    #[error("Backend error: {0}")]
    Backend(String),

    /// An error raised by a skill during invocation.
    #[error("Skill error: {0}")]
    Skill(String),

    /// An error while publishing to or resolving from a channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An error from the scheduler or the multiverse layer.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// The run or node was cancelled (explicit abort or timeout).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrewError {
    /// Returns true when the error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CrewError::Cancelled(_))
    }
}

/// A convenience `Result` alias using [`CrewError`].
pub type CrewResult<T> = Result<T, CrewError>;
