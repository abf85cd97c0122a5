//! deno_core op definitions for the sandchart sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; the functions and types themselves are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::context::{LogLevel, LogLine};
use crate::{HookDispatcher, HookError};

/// Maximum length of a hook name.
const MAX_HOOK_NAME_LEN: usize = 128;

/// Per-run state stored in OpState while a run is active.
///
/// Replaced at the start of every run. Ops that carry a run id compare it to
/// [`ActiveRun::id`] so that work left behind by a timed-out run can neither
/// reach the host nor overwrite the result of the run that replaced it.
pub struct ActiveRun {
    /// Identifier of the run currently owning the context.
    pub id: u32,
    /// Hook dispatcher for this run.
    pub hooks: Arc<dyn HookDispatcher>,
    /// Maximum number of hook calls allowed.
    pub max_hook_calls: usize,
    /// Maximum size of serialized hook arguments.
    pub max_hook_args_size: usize,
    /// Number of hook calls made so far.
    pub hook_calls_made: usize,
    /// Maximum number of captured console lines.
    pub max_log_lines: usize,
    /// Captured console output.
    pub logs: Vec<LogLine>,
    /// Lines dropped after `max_log_lines` was reached.
    pub dropped_log_lines: usize,
    /// Serialized result envelope, once the run settled.
    pub result: Option<String>,
}

/// Runs that ended with an error or at their deadline.
///
/// Callbacks they left queued can still fire while a later run drives the
/// event loop; their console output is discarded instead of being credited
/// to that later run.
#[derive(Debug, Default)]
pub struct AbandonedRuns(pub HashSet<u32>);

/// Run id of the context-wide console, which is not bound to any run.
pub const AMBIENT_RUN_ID: u32 = 0;

/// Capture a console line from sandboxed code.
///
/// Lines from the active run, from runs that completed normally (module
/// functions called later) and from the ambient console go to the active
/// run. Lines from abandoned runs are dropped.
#[op2(fast)]
pub fn op_sandchart_log(
    state: &mut OpState,
    #[smi] run_id: u32,
    #[string] level: &str,
    #[string] msg: &str,
) {
    if state
        .try_borrow::<AbandonedRuns>()
        .is_some_and(|abandoned| abandoned.0.contains(&run_id))
    {
        tracing::debug!(target: "sandchart::sandbox::js", run_id, "dropping console line of an abandoned run");
        return;
    }

    let level = LogLevel::parse(level);
    match level {
        LogLevel::Error => tracing::warn!(target: "sandchart::sandbox::js", "{}", msg),
        LogLevel::Debug => tracing::debug!(target: "sandchart::sandbox::js", "{}", msg),
        _ => tracing::info!(target: "sandchart::sandbox::js", "{}", msg),
    }

    if let Some(run) = state.try_borrow_mut::<ActiveRun>() {
        if run.logs.len() < run.max_log_lines {
            run.logs.push(LogLine {
                level,
                message: msg.to_string(),
            });
        } else {
            run.dropped_log_lines += 1;
        }
    }
}

/// Store the settled result envelope of a run.
///
/// Envelopes from runs other than the active one are discarded.
#[op2(fast)]
pub fn op_sandchart_set_result(state: &mut OpState, #[smi] run_id: u32, #[string] json: &str) {
    match state.try_borrow_mut::<ActiveRun>() {
        Some(run) if run.id == run_id => run.result = Some(json.to_string()),
        _ => tracing::debug!(run_id, "discarding result of a stale run"),
    }
}

/// Validate a hook name as written by fragment code.
pub fn validate_hook_name(hook: &str) -> Result<(), String> {
    if hook.is_empty() {
        return Err("hook name must not be empty".into());
    }
    if hook.len() > MAX_HOOK_NAME_LEN {
        return Err(format!(
            "hook name too long ({} bytes, max {} bytes)",
            hook.len(),
            MAX_HOOK_NAME_LEN
        ));
    }
    if hook.chars().any(|c| c.is_control()) {
        return Err("hook name must not contain control characters".into());
    }
    Ok(())
}

/// Call a host hook via the run's [`HookDispatcher`].
///
/// Enforces per-run call count and argument size limits. Host errors are
/// redacted before they become JavaScript exceptions.
#[op2(async)]
#[string]
pub async fn op_sandchart_call_hook(
    op_state: Rc<RefCell<OpState>>,
    #[smi] run_id: u32,
    #[string] hook: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(hook = %hook, args_len = args_json.len(), "hook call dispatched");

    validate_hook_name(&hook).map_err(JsErrorBox::generic)?;

    let dispatcher = {
        let mut st = op_state.borrow_mut();
        let run = match st.try_borrow_mut::<ActiveRun>() {
            Some(run) if run.id == run_id => run,
            _ => {
                return Err(JsErrorBox::generic(
                    "hook call rejected: the run that issued it is no longer active",
                ))
            }
        };
        if run.hook_calls_made >= run.max_hook_calls {
            return Err(JsErrorBox::generic(format!(
                "hook call limit exceeded (max {} calls per run)",
                run.max_hook_calls
            )));
        }
        if args_json.len() > run.max_hook_args_size {
            return Err(JsErrorBox::generic(format!(
                "hook args too large ({} bytes, max {} bytes)",
                args_json.len(),
                run.max_hook_args_size
            )));
        }
        run.hook_calls_made += 1;
        run.hooks.clone()
    };

    let args: serde_json::Value = serde_json::from_str(&args_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid JSON args: {e}")))?;

    let envelope = match dispatcher.call(&hook, args).await {
        Ok(result) => serde_json::json!({ "ok": result }),
        Err(e) => {
            let known = dispatcher.hook_names();
            let known: Vec<&str> = known.iter().map(String::as_str).collect();
            hook_error_envelope(&hook, &e, &known)
        }
    };

    serde_json::to_string(&envelope)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

/// Envelope for a failed hook call; the bootstrap rethrows it as an `Error`
/// carrying `code` and `retryable`.
pub fn hook_error_envelope(hook: &str, err: &HookError, known_hooks: &[&str]) -> serde_json::Value {
    let mut structured = err.to_structured_error(Some(known_hooks));
    let mut message = crate::redact::redact_hook_error(hook, &err.to_string());
    if let Some(fix) = structured.get("suggested_fix").and_then(|f| f.as_str()) {
        message.push_str(". ");
        message.push_str(fix);
    }
    structured["message"] = serde_json::Value::String(message);
    serde_json::json!({ "error": structured })
}

deno_core::extension!(
    sandchart_ext,
    ops = [op_sandchart_log, op_sandchart_set_result, op_sandchart_call_hook],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_hook_names() {
        assert!(validate_hook_name("fetchData").is_ok());
        assert!(validate_hook_name("metrics.report").is_ok());
    }

    #[test]
    fn rejects_empty_hook_name() {
        let err = validate_hook_name("").unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn rejects_overlong_hook_name() {
        let err = validate_hook_name(&"h".repeat(MAX_HOOK_NAME_LEN + 1)).unwrap_err();
        assert!(err.contains("too long"), "got: {err}");
        assert!(validate_hook_name(&"h".repeat(MAX_HOOK_NAME_LEN)).is_ok());
    }

    #[test]
    fn hook_error_envelope_carries_code_and_retryable() {
        let err = HookError::Upstream {
            hook: "rows".into(),
            message: "backend at 10.0.0.7:5432 unavailable".into(),
        };
        let envelope = hook_error_envelope("rows", &err, &[]);
        let error = &envelope["error"];
        assert_eq!(error["code"], "UPSTREAM_ERROR");
        assert_eq!(error["retryable"], true);
        let message = error["message"].as_str().unwrap();
        assert!(message.starts_with("hook 'rows' failed"), "got: {message}");
        assert!(!message.contains("10.0.0.7"), "got: {message}");
    }

    #[test]
    fn hook_error_envelope_appends_suggestion() {
        let err = HookError::HookNotFound("fetchRos".into());
        let envelope = hook_error_envelope("fetchRos", &err, &["fetchRows", "report"]);
        assert_eq!(envelope["error"]["code"], "HOOK_NOT_FOUND");
        assert_eq!(envelope["error"]["retryable"], false);
        assert!(envelope["error"]["message"]
            .as_str()
            .unwrap()
            .contains("fetchRows"));
    }

    #[test]
    fn rejects_control_characters() {
        let err = validate_hook_name("fetch\nData").unwrap_err();
        assert!(err.contains("control"));
    }
}
