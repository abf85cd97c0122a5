#![warn(missing_docs)]

//! # sandchart-sandbox
//!
//! Isolated V8 execution contexts for chart fragment code.
//!
//! A [`Sandbox`] hands out [`ExecutionContext`]s. Each context owns one
//! deno_core isolate pinned to a dedicated thread, and keeps its JavaScript
//! heap alive between runs so that modules and per-context shared state
//! persist for the lifetime of one chart build.
//!
//! ## Isolation model
//!
//! - **V8 isolate per context**: contexts never share heap or globals
//! - **No ambient capabilities**: no fs, net, env, `Deno` or `eval`
//! - **Host capability by injection only**: fragment code reaches the host
//!   through the `hooks` object, which routes to a [`HookDispatcher`]
//! - **Hard deadlines**: a watchdog terminates runaway runs, then the
//!   termination is cancelled so the context can serve the next run
//! - **Heap ceiling**: approaching the limit terminates the run and poisons
//!   the context

pub mod audit;
pub mod context;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod redact;
pub mod validator;

pub use audit::RunKind;
pub use context::{
    ExecutionContext, LogLevel, LogLine, RunOutput, RunRequest, Sandbox, SandboxConfig,
};
pub use error::SandboxError;
pub use sandchart_error::HookError;

/// Trait for dispatching hook calls from fragment code to the host.
///
/// Hooks are the only way sandboxed code can reach host capabilities such as
/// dataset fetches or telemetry. Fragment code calls `hooks.<name>(args)` and
/// receives a promise of the JSON value returned here.
#[async_trait::async_trait]
pub trait HookDispatcher: Send + Sync {
    /// Call a hook by name.
    ///
    /// - `hook`: The hook name as written in fragment code (e.g. `"fetchData"`)
    /// - `args`: The first argument passed by the fragment, as JSON
    async fn call(&self, hook: &str, args: serde_json::Value) -> Result<serde_json::Value, HookError>;

    /// Names of the hooks this dispatcher serves, used for error suggestions.
    fn hook_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A dispatcher that serves no hooks. Every call fails with [`HookError::HookNotFound`].
pub struct NoHooks;

#[async_trait::async_trait]
impl HookDispatcher for NoHooks {
    async fn call(&self, hook: &str, _args: serde_json::Value) -> Result<serde_json::Value, HookError> {
        Err(HookError::HookNotFound(hook.to_string()))
    }
}
