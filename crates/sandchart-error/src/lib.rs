//! Typed error types for sandchart hook dispatch.
//!
//! Provides [`HookError`], the canonical error type returned by
//! `HookDispatcher` implementations when fragment code calls a host hook.

use thiserror::Error;

/// Canonical error type for hook dispatch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HookError {
    /// The fragment called a hook the host does not provide.
    #[error("hook not found: '{0}'")]
    HookNotFound(String),

    /// The hook arguments were rejected by the host.
    #[error("invalid arguments for hook '{hook}': {reason}")]
    InvalidArguments {
        /// The hook that was called.
        hook: String,
        /// Why the arguments were rejected.
        reason: String,
    },

    /// The hook did not answer in time.
    #[error("hook '{hook}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The hook that timed out.
        hook: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A per-execution hook call limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// A downstream service behind the hook returned an error.
    #[error("upstream error from hook '{hook}': {message}")]
    Upstream {
        /// The hook whose backend failed.
        hook: String,
        /// The upstream error message.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HookError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HookNotFound(_) => "HOOK_NOT_FOUND",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the hook call may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimit(_) | Self::Upstream { .. } => true,
            Self::HookNotFound(_) | Self::InvalidArguments { .. } | Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object handed to fragment code.
    ///
    /// When `known_hooks` is provided and the error is [`HookError::HookNotFound`],
    /// the closest hook name (edit distance ≤ 3) is offered as `suggested_fix`.
    pub fn to_structured_error(&self, known_hooks: Option<&[&str]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::HookNotFound(name) => known_hooks.and_then(|hooks| find_similar_hook(name, hooks)),
            Self::Timeout { .. } => Some("Retry with a smaller request".to_string()),
            Self::RateLimit(_) => Some("Reduce the number of hook calls".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest matching hook name using Levenshtein distance.
fn find_similar_hook(name: &str, known_hooks: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for &candidate in known_hooks {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, candidate));
        }
    }

    best.map(|(_, hook)| format!("Did you mean hook '{hook}'?"))
}

const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<HookError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hook_not_found() {
        let err = HookError::HookNotFound("fetchData".into());
        assert_eq!(err.to_string(), "hook not found: 'fetchData'");
    }

    #[test]
    fn display_timeout() {
        let err = HookError::Timeout {
            hook: "fetchData".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "hook 'fetchData' timed out after 250ms");
    }

    #[test]
    fn display_upstream() {
        let err = HookError::Upstream {
            hook: "dataset".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "upstream error from hook 'dataset': connection refused"
        );
    }

    #[test]
    fn internal_is_display_transparent() {
        let err = HookError::Internal(anyhow::anyhow!("root cause"));
        assert_eq!(err.to_string(), "root cause");
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(HookError, &str)> = vec![
            (HookError::HookNotFound("x".into()), "HOOK_NOT_FOUND"),
            (
                HookError::InvalidArguments {
                    hook: "h".into(),
                    reason: "r".into(),
                },
                "INVALID_ARGUMENTS",
            ),
            (
                HookError::Timeout {
                    hook: "h".into(),
                    timeout_ms: 1,
                },
                "TIMEOUT",
            ),
            (HookError::RateLimit("x".into()), "RATE_LIMIT"),
            (
                HookError::Upstream {
                    hook: "h".into(),
                    message: "m".into(),
                },
                "UPSTREAM_ERROR",
            ),
            (HookError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.code(), *expected, "wrong code for {err}");
        }
    }

    #[test]
    fn retryable_split() {
        assert!(HookError::RateLimit("x".into()).retryable());
        assert!(HookError::Timeout {
            hook: "h".into(),
            timeout_ms: 1
        }
        .retryable());
        assert!(!HookError::HookNotFound("x".into()).retryable());
        assert!(!HookError::Internal(anyhow::anyhow!("x")).retryable());
    }

    #[test]
    fn structured_error_suggests_close_hook() {
        let err = HookError::HookNotFound("fetchDta".into());
        let json = err.to_structured_error(Some(&["fetchData", "reportMetric"]));
        assert_eq!(json["code"], "HOOK_NOT_FOUND");
        assert_eq!(json["retryable"], false);
        let fix = json["suggested_fix"].as_str().unwrap();
        assert!(fix.contains("fetchData"), "expected suggestion, got: {fix}");
    }

    #[test]
    fn structured_error_without_match_has_no_fix() {
        let err = HookError::HookNotFound("zzzzzzzz".into());
        let json = err.to_structured_error(Some(&["fetchData"]));
        assert!(json.get("suggested_fix").is_none());
    }
}
