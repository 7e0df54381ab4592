use thiserror::Error;

/// Errors that halt a pipeline run.
///
/// Cache and memory reclamation problems are never reported through this type;
/// they degrade to a recompute or a warning instead.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("No action implementation registered for '{0}'")]
    UnknownAction(String),

    #[error("Pipeline has no actions")]
    EmptyPipeline,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to construct action '{action}': {source}")]
    Construction {
        action: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Action '{action}' failed: {source}")]
    Execution {
        action: String,
        #[source]
        source: anyhow::Error,
    },
}
