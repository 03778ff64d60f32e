use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("{module} is already started")]
    AlreadyRunning { module: String },

    #[error("{module} is not running")]
    NotRunning { module: String },

    #[error("{module} must be stopped first to change '{field}'")]
    ConfigState { module: String, field: &'static str },

    #[error("{module}: blocking call issued from the module's own context")]
    Reentrant { module: String },

    #[error("{module} context panicked, the module can no longer be started")]
    Poisoned { module: String },

    /// The call panicked; the context caught it and keeps running
    #[error("{module}: call panicked: {message}")]
    Panicked { module: String, message: String },

    #[error("Failed to spawn {module} context: {source}")]
    Spawn {
        module: String,
        source: std::io::Error,
    },

    #[error("{module} setup failed: {source:#}")]
    Setup {
        module: String,
        source: anyhow::Error,
    },

    #[error("Module '{0}' is already registered")]
    Duplicate(String),

    /// Error returned by a dispatched call, passed through untouched
    #[error(transparent)]
    Call(anyhow::Error),
}

impl ModuleError {
    /// Downcast the error of a dispatched call.
    pub fn call_error<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            ModuleError::Call(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }
}
