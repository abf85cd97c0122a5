//! Error types for the build pipeline.

use sandchart_sandbox::SandboxError;
use thiserror::Error;

/// Errors produced by a [`BuildSession`](crate::BuildSession).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The chart configuration or its shared-state blob is malformed.
    #[error("invalid chart configuration: {0}")]
    Config(String),

    /// The isolated context could not be allocated, or ran out of memory.
    #[error("sandbox resources exhausted: {0}")]
    ResourceExhausted(#[source] SandboxError),

    /// The dependency resolver failed.
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(#[from] ResolveError),

    /// A dependency module failed to load. Remaining modules were skipped.
    #[error("module '{name}' failed to load: {cause}")]
    ModuleLoad {
        /// Module name.
        name: String,
        /// Underlying failure.
        #[source]
        cause: SandboxError,
    },

    /// A stage did not settle before its deadline.
    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        /// Stage label.
        stage: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A stage threw or produced an unusable result.
    #[error("stage '{stage}' failed: {cause}")]
    FragmentExecution {
        /// Stage label.
        stage: String,
        /// Underlying failure.
        #[source]
        cause: SandboxError,
    },

    /// The operation is not allowed in the session's current state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The isolate thread failed in a way unrelated to the code it ran.
    #[error("sandbox failure: {0}")]
    Sandbox(#[source] SandboxError),
}

impl BuildError {
    /// Map a sandbox failure during a stage to the build taxonomy.
    pub(crate) fn from_stage(stage: &str, err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout { timeout_ms } => Self::ExecutionTimeout {
                stage: stage.to_string(),
                timeout_ms,
            },
            SandboxError::HeapLimitExceeded
            | SandboxError::ConcurrencyLimit { .. }
            | SandboxError::ContextAllocation { .. } => Self::ResourceExhausted(err),
            SandboxError::Released => {
                Self::InvalidState("the build session has been closed".into())
            }
            SandboxError::Execution(_) => Self::Sandbox(err),
            cause => Self::FragmentExecution {
                stage: stage.to_string(),
                cause,
            },
        }
    }

    /// Map a sandbox failure of session housekeeping to the build taxonomy.
    pub(crate) fn from_setup(err: SandboxError) -> Self {
        match err {
            SandboxError::HeapLimitExceeded
            | SandboxError::ConcurrencyLimit { .. }
            | SandboxError::ContextAllocation { .. } => Self::ResourceExhausted(err),
            SandboxError::Released => {
                Self::InvalidState("the build session has been closed".into())
            }
            other => Self::Sandbox(other),
        }
    }

    /// Whether the error came from a stage deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. })
    }
}

/// Errors from a [`DependencyResolver`](crate::DependencyResolver).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// A required module does not exist in the store.
    #[error("module '{name}' not found (required by '{required_by}')")]
    NotFound {
        /// Missing module.
        name: String,
        /// Fragment field or module that required it.
        required_by: String,
    },

    /// Modules require each other.
    #[error("circular dependency: {}", chain.join(" -> "))]
    Cycle {
        /// The require chain, ending with the repeated module.
        chain: Vec<String>,
    },

    /// The require chain is deeper than allowed.
    #[error("dependency chain through '{name}' exceeds maximum depth {max_depth}")]
    TooDeep {
        /// Module at which the limit was hit.
        name: String,
        /// Configured maximum.
        max_depth: usize,
    },

    /// A module name cannot be mapped to a store entry.
    #[error("invalid module name '{name}'")]
    InvalidName {
        /// The offending name.
        name: String,
    },

    /// The module store failed.
    #[error("failed to read module '{name}': {source}")]
    Store {
        /// Module being read.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
