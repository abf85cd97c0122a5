//! Error types for the sandchart sandbox.

use thiserror::Error;

/// Errors that can occur while creating or running an execution context.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed validation checks.
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. Sandboxed code has no runtime, module or code-generation access. Use the hooks object to reach the host.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// Execution result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The run did not settle before its deadline.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A JavaScript error was thrown during execution.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
        /// The JavaScript stack, when one was available.
        stack: Option<String>,
    },

    /// V8 heap memory limit was exceeded. The context is unusable afterwards.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Too many live execution contexts.
    #[error("concurrency limit reached (max {max} live contexts)")]
    ConcurrencyLimit {
        /// Maximum allowed live contexts.
        max: usize,
    },

    /// The isolate or its thread could not be allocated.
    #[error("failed to allocate execution context: {reason}")]
    ContextAllocation {
        /// Why allocation failed.
        reason: String,
    },

    /// The context was already released.
    #[error("execution context has been released")]
    Released,

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// Short, stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } | Self::CodeTooLarge { .. } | Self::BannedPattern { .. } => {
                "validation"
            }
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Timeout { .. } => "timeout",
            Self::JsError { .. } => "js_error",
            Self::HeapLimitExceeded => "heap_limit",
            Self::ConcurrencyLimit { .. } | Self::ContextAllocation { .. } => "allocation",
            Self::Released => "released",
            Self::Serialization(_) => "serialization",
            Self::Execution(_) => "execution",
        }
    }
}
