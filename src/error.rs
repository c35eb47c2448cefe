use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::TaskIdentifier;

pub use anyhow::Error as RuntimeError;

/// A cheaply cloneable wrapper around a userland error, so that the same
/// failure can be handed to every task waiting on it.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        SharedError(Arc::new(e))
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Coarse classification of a [`TaskError`], looking through execution
/// failures that merely re-raised another task's error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    Execution,
    Deadlock,
    EnvironmentSelection,
    IllegalOperation,
    PropertyComputation,
    Cluster,
    Io,
    Cancelled,
}

/// Failure of a single task, as seen by everyone who waits for it.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Task '{id}' failed: {cause}{}", Suppressed(.suppressed))]
    Execution {
        id: TaskIdentifier,
        cause: SharedError,
        suppressed: Vec<SharedError>,
    },

    #[error("Task '{0}' deadlocked while waiting for another task")]
    Deadlock(TaskIdentifier),

    #[error("No suitable environment for task '{id}': {message}")]
    EnvironmentSelection { id: TaskIdentifier, message: String },

    #[error("Illegal operation in task '{id}': {message}")]
    IllegalOperation { id: TaskIdentifier, message: String },

    #[error("Failed to compute property '{property}': {cause}")]
    PropertyComputation { property: String, cause: SharedError },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Build execution was cancelled")]
    Cancelled,
}

struct Suppressed<'a>(&'a [SharedError]);

impl fmt::Display for Suppressed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in self.0 {
            write!(f, "\n  suppressed: {err}")?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Io(Arc::new(e))
    }
}

impl TaskError {
    pub(crate) fn illegal(id: &TaskIdentifier, message: impl Into<String>) -> Self {
        TaskError::IllegalOperation {
            id: id.clone(),
            message: message.into(),
        }
    }

    /// Returns the kind of the underlying failure. An execution failure whose
    /// cause is itself a [`TaskError`] reports the kind of that cause.
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            TaskError::Execution { cause, .. } => match cause.downcast_ref::<TaskError>() {
                Some(inner) => inner.kind(),
                None => TaskErrorKind::Execution,
            },
            TaskError::Deadlock(_) => TaskErrorKind::Deadlock,
            TaskError::EnvironmentSelection { .. } => TaskErrorKind::EnvironmentSelection,
            TaskError::IllegalOperation { .. } => TaskErrorKind::IllegalOperation,
            TaskError::PropertyComputation { .. } => TaskErrorKind::PropertyComputation,
            TaskError::Cluster(_) => TaskErrorKind::Cluster,
            TaskError::Io(_) => TaskErrorKind::Io,
            TaskError::Cancelled => TaskErrorKind::Cancelled,
        }
    }

    pub fn is_deadlock(&self) -> bool {
        self.kind() == TaskErrorKind::Deadlock
    }

    pub fn is_illegal_operation(&self) -> bool {
        self.kind() == TaskErrorKind::IllegalOperation
    }

    /// Exceptions suppressed in favour of the primary cause.
    pub fn suppressed(&self) -> &[SharedError] {
        match self {
            TaskError::Execution { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ClusterError {
    #[error("Connection to '{0}' was lost")]
    ConnectionLost(String),

    /// The caller gave up on its pending calls with `cancel_all`.
    #[error("Call to '{0}' was cancelled")]
    Cancelled(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Incompatible protocol version {found}, expected {expected}")]
    Incompatible { expected: u32, found: u32 },

    #[error("Remote '{remote}' failed: {message}")]
    Remote { remote: String, message: String },

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No {kind} codec registered under tag '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },

    #[error("Couldn't decode {kind} '{tag}': {message}")]
    Decode {
        kind: &'static str,
        tag: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode database entry: {0}")]
    Encode(String),

    #[error("Not a task database (bad magic)")]
    BadMagic,

    #[error("Corrupt task database: {0}")]
    Corrupt(String),

    #[error("Unsupported database schema version {0}")]
    Version(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {name}")]
    InvalidOverride { name: &'static str, value: String },
}

/// Errors which are fatal to a whole build execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error while accessing the task database.\n{0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine consistency violation: {0}")]
    Internal(String),

    #[error("Another execution is already running on this engine")]
    Busy,
}
