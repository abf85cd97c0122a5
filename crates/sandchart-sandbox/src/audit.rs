//! Audit logging for sandbox runs.
//!
//! Every run inside an execution context emits an [`AuditEntry`] containing:
//! - Execution ID (UUID) and the owning context ID
//! - The run label (stage or module name) and kind
//! - SHA-256 hash of the code (never raw code in logs)
//! - A redacted preview of the first 500 bytes of code
//! - Hook calls made (with hashed args, not raw)
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{HookDispatcher, HookError, SandboxError};

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// Identifier of the execution context the run happened in.
    pub context_id: String,
    /// ISO-8601 timestamp of when the run started.
    pub timestamp: DateTime<Utc>,
    /// Stage or module name.
    pub label: String,
    /// What kind of code ran.
    pub kind: RunKind,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N bytes of the code, redacted.
    pub code_preview: String,
    /// Hook calls made during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_calls: Vec<HookCallAudit>,
    /// Number of console lines captured.
    pub log_lines: usize,
    /// Total run duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The kind of code executed by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunKind {
    /// Context housekeeping such as installing shared state.
    Setup,
    /// A dependency module.
    Module,
    /// A chart fragment.
    Fragment,
}

/// Audit record for a single hook call within a run.
#[derive(Debug, Clone, Serialize)]
pub struct HookCallAudit {
    /// Hook name.
    pub hook: String,
    /// SHA-256 hash of the serialized arguments (args never stored raw).
    pub args_hash: String,
    /// Duration of this hook call in milliseconds.
    pub duration_ms: u64,
    /// Whether the hook call succeeded.
    pub success: bool,
}

/// The outcome of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The run settled successfully.
    Success,
    /// The run failed with an error.
    Error {
        /// The error message.
        message: String,
    },
    /// The run was terminated at its deadline.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true`. Use
/// `RUST_LOG=sandchart=info` to capture them.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            context_id = %entry.context_id,
            label = %entry.label,
            kind = ?entry.kind,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            hook_calls = entry.hook_calls.len(),
            log_lines = entry.log_lines,
            outcome = outcome,
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let result = hasher.finalize();
    let mut s = String::with_capacity(result.len() * 2);
    for b in result {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        code.to_string()
    } else {
        let mut end = CODE_PREVIEW_MAX;
        while !code.is_char_boundary(end) {
            end -= 1;
        }
        let mut preview = code[..end].to_string();
        preview.push_str("...");
        preview
    }
}

/// Builder for constructing audit entries during a run.
pub struct AuditEntryBuilder {
    execution_id: String,
    context_id: String,
    timestamp: DateTime<Utc>,
    label: String,
    kind: RunKind,
    code_hash: String,
    code_preview: String,
    hook_calls: Vec<HookCallAudit>,
    log_lines: usize,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a run.
    pub fn new(context_id: &str, label: &str, kind: RunKind, code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
            timestamp: Utc::now(),
            label: label.to_string(),
            kind,
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_error_message(&code_preview(code)),
            hook_calls: Vec::new(),
            log_lines: 0,
            start: Instant::now(),
        }
    }

    /// Record a hook call.
    pub fn record_hook_call(&mut self, audit: HookCallAudit) {
        self.hook_calls.push(audit);
    }

    /// Record how many console lines the run produced.
    pub fn log_lines(&mut self, count: usize) {
        self.log_lines = count;
    }

    /// Finalize the audit entry with the run result.
    pub fn finish(self, result: Result<&serde_json::Value, &SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(value) => {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    message: crate::redact::redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            context_id: self.context_id,
            timestamp: self.timestamp,
            label: self.label,
            kind: self.kind,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            hook_calls: self.hook_calls,
            log_lines: self.log_lines,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

/// An audit-recording wrapper around a [`HookDispatcher`].
pub struct AuditingHookDispatcher {
    inner: Arc<dyn HookDispatcher>,
    audit_tx: tokio::sync::mpsc::UnboundedSender<HookCallAudit>,
}

impl AuditingHookDispatcher {
    /// Wrap a dispatcher with audit recording.
    pub fn new(
        inner: Arc<dyn HookDispatcher>,
        audit_tx: tokio::sync::mpsc::UnboundedSender<HookCallAudit>,
    ) -> Self {
        Self { inner, audit_tx }
    }
}

#[async_trait::async_trait]
impl HookDispatcher for AuditingHookDispatcher {
    async fn call(&self, hook: &str, args: serde_json::Value) -> Result<serde_json::Value, HookError> {
        let args_hash = sha256_hex(&serde_json::to_string(&args).unwrap_or_default());
        let start = Instant::now();

        let result = self.inner.call(hook, args).await;

        let audit = HookCallAudit {
            hook: hook.to_string(),
            args_hash,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        };
        let _ = self.audit_tx.send(audit);

        result
    }

    fn hook_names(&self) -> Vec<String> {
        self.inner.hook_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            execution_id: "test-id".into(),
            context_id: "ctx-1".into(),
            timestamp: Utc::now(),
            label: "Params".into(),
            kind: RunKind::Fragment,
            code_hash: "abc123".into(),
            code_preview: "module.exports = {};".into(),
            hook_calls: vec![],
            log_lines: 0,
            duration_ms: 42,
            result_size_bytes: 2,
            outcome,
        }
    }

    #[test]
    fn sha256_hex_produces_correct_hash() {
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn code_preview_short_code_unchanged() {
        let code = "module.exports = 42;";
        assert_eq!(code_preview(code), code);
    }

    #[test]
    fn code_preview_long_code_truncated() {
        let preview = code_preview(&"x".repeat(1000));
        assert_eq!(preview.len(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn code_preview_multibyte_boundary() {
        let mut code = "a".repeat(499);
        code.push('\u{1F600}');
        code.push_str(&"b".repeat(100));
        let preview = code_preview(&code);
        assert!(preview.starts_with(&"a".repeat(499)));
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn builder_records_success() {
        let code = "module.exports = 1;";
        let builder = AuditEntryBuilder::new("ctx", "JavaScript", RunKind::Fragment, code);
        let value = serde_json::json!(1);
        let entry = builder.finish(Ok(&value));

        assert!(Uuid::parse_str(&entry.execution_id).is_ok());
        assert_eq!(entry.label, "JavaScript");
        assert_eq!(entry.code_preview, code);
        assert_eq!(entry.result_size_bytes, 1);
        assert!(matches!(entry.outcome, AuditOutcome::Success));
    }

    #[test]
    fn builder_records_timeout() {
        let builder = AuditEntryBuilder::new("ctx", "UI", RunKind::Fragment, "while(true){}");
        let err = SandboxError::Timeout { timeout_ms: 1000 };
        let entry = builder.finish(Err(&err));
        assert!(matches!(entry.outcome, AuditOutcome::Timeout));
    }

    #[test]
    fn builder_redacts_error_outcome() {
        let builder = AuditEntryBuilder::new("ctx", "lib/utils", RunKind::Module, "x");
        let err = SandboxError::JsError {
            message: "failed reading /home/charts/secret.json".into(),
            stack: None,
        };
        let entry = builder.finish(Err(&err));
        match entry.outcome {
            AuditOutcome::Error { message } => {
                assert!(!message.contains("/home/charts"), "got: {message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn entry_never_contains_raw_code() {
        let secret_code = "const token = 'sk-secret-12345'; module.exports = token;";
        let builder = AuditEntryBuilder::new("ctx", "Params", RunKind::Fragment, secret_code);
        let entry = builder.finish(Ok(&serde_json::json!("ok")));
        let parsed = serde_json::to_value(&entry).expect("serialize");
        assert!(parsed.get("code").is_none());
        assert_eq!(entry.code_hash, sha256_hex(secret_code));
        assert_eq!(entry.code_hash.len(), 64);
    }

    #[tokio::test]
    async fn json_lines_logger_writes_valid_json() {
        let logger = JsonLinesAuditLogger::new(Vec::<u8>::new());
        logger.log(&entry(AuditOutcome::Success)).await;

        let writer = logger.writer.lock().await;
        let output = String::from_utf8(writer.clone()).unwrap();
        assert!(output.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(parsed["execution_id"], "test-id");
        assert_eq!(parsed["kind"], "fragment");
        assert_eq!(parsed["outcome"], "success");
        assert!(parsed.get("hook_calls").is_none(), "empty hook calls are omitted");
    }

    #[tokio::test]
    async fn tracing_logger_handles_every_outcome() {
        let logger = TracingAuditLogger;
        logger.log(&entry(AuditOutcome::Success)).await;
        logger.log(&entry(AuditOutcome::Timeout)).await;
        logger
            .log(&entry(AuditOutcome::Error {
                message: "boom".into(),
            }))
            .await;
    }

    #[tokio::test]
    async fn auditing_dispatcher_records_calls() {
        struct Echo;

        #[async_trait::async_trait]
        impl HookDispatcher for Echo {
            async fn call(
                &self,
                hook: &str,
                args: serde_json::Value,
            ) -> Result<serde_json::Value, HookError> {
                if hook == "fail" {
                    return Err(HookError::HookNotFound(hook.into()));
                }
                Ok(args)
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = AuditingHookDispatcher::new(Arc::new(Echo), tx);

        let value = dispatcher.call("echo", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(value["a"], 1);
        assert!(dispatcher.call("fail", serde_json::Value::Null).await.is_err());

        let first = rx.try_recv().unwrap();
        assert_eq!(first.hook, "echo");
        assert!(first.success);
        assert_eq!(first.args_hash, sha256_hex(r#"{"a":1}"#));
        let second = rx.try_recv().unwrap();
        assert!(!second.success);
    }
}
