//! Security and audit checks through the full run pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandchart_sandbox::audit::{sha256_hex, AuditEntry, AuditLogger, AuditOutcome};
use sandchart_sandbox::{
    HookDispatcher, HookError, RunKind, RunRequest, Sandbox, SandboxConfig, SandboxError,
};
use serde_json::{json, Value};

#[derive(Default)]
struct CollectingLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

#[async_trait::async_trait]
impl AuditLogger for CollectingLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

struct LeakyHooks;

#[async_trait::async_trait]
impl HookDispatcher for LeakyHooks {
    async fn call(&self, hook: &str, _args: Value) -> Result<Value, HookError> {
        match hook {
            "rows" => Ok(json!([1, 2, 3])),
            other => Err(HookError::Upstream {
                hook: other.to_string(),
                message: "GET https://internal.example.net/v1/rows?token=s3cr3t failed: /srv/data/rows.db locked"
                    .into(),
            }),
        }
    }
}

#[tokio::test]
async fn runtime_globals_are_unreachable() {
    let mut ctx = Sandbox::new(SandboxConfig::default()).create().await.unwrap();
    let out = ctx
        .run(RunRequest::new(
            "escape",
            "return [typeof globalThis.Deno, typeof fetch, typeof require, typeof process, typeof host.require];",
        ))
        .await
        .unwrap();
    assert_eq!(
        out.value,
        json!(["undefined", "undefined", "undefined", "undefined", "function"])
    );
}

#[tokio::test]
async fn host_internals_cannot_be_replaced() {
    let mut ctx = Sandbox::new(SandboxConfig::default()).create().await.unwrap();
    let out = ctx
        .run(RunRequest::new(
            "tamper",
            r#"try { globalThis.console = null; } catch (_) {}
               try { host.require = null; } catch (_) {}
               return [typeof console.log, typeof host.require];"#,
        ))
        .await
        .unwrap();
    assert_eq!(out.value, json!(["function", "function"]));
}

#[tokio::test]
async fn upstream_hook_errors_are_redacted_in_fragment_code() {
    let mut ctx = Sandbox::new(SandboxConfig::default()).create().await.unwrap();
    let out = ctx
        .run(
            RunRequest::new(
                "rows",
                "try { await host.hooks.fetchRows(); } catch (e) { return e.message; }",
            )
            .hooks(Arc::new(LeakyHooks)),
        )
        .await
        .unwrap();
    let message = out.value.as_str().unwrap();
    assert!(!message.contains("s3cr3t"), "token leaked: {message}");
    assert!(!message.contains("internal.example.net"), "url leaked: {message}");
    assert!(!message.contains("/srv/data"), "path leaked: {message}");
}

#[tokio::test]
async fn every_run_is_audited() {
    let logger = Arc::new(CollectingLogger::default());
    let sandbox = Sandbox::with_audit_logger(SandboxConfig::default(), logger.clone());
    let mut ctx = sandbox.create().await.unwrap();

    ctx.run(
        RunRequest::new("Params", "console.log('hi'); return await host.hooks.rows();")
            .hooks(Arc::new(LeakyHooks)),
    )
    .await
    .unwrap();
    ctx.run(
        RunRequest::new("lib", "throw new Error('boom');").kind(RunKind::Module),
    )
    .await
    .unwrap_err();
    let err = ctx
        .run(RunRequest::new("JavaScript", "while (true) {}").timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout { timeout_ms: 100 }));

    let entries = logger.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), 3);

    let first = &entries[0];
    assert_eq!(first.label, "Params");
    assert_eq!(first.kind, RunKind::Fragment);
    assert_eq!(first.context_id, ctx.id());
    assert_eq!(first.log_lines, 1);
    assert_eq!(first.hook_calls.len(), 1);
    assert_eq!(first.hook_calls[0].hook, "rows");
    assert!(first.hook_calls[0].success);
    assert!(matches!(first.outcome, AuditOutcome::Success));
    assert_eq!(first.code_hash.len(), 64);

    assert_eq!(entries[1].kind, RunKind::Module);
    assert!(matches!(entries[1].outcome, AuditOutcome::Error { .. }));
    assert!(matches!(entries[2].outcome, AuditOutcome::Timeout));
    assert_ne!(entries[0].execution_id, entries[1].execution_id);
}

#[tokio::test]
async fn audit_records_author_source_not_generated_body() {
    let logger = Arc::new(CollectingLogger::default());
    let sandbox = Sandbox::with_audit_logger(SandboxConfig::default(), logger.clone());
    let mut ctx = sandbox.create().await.unwrap();

    let source = "module.exports = { total: 42 };";
    let body = format!("const module = {{ exports: {{}} }};\n{source}\nreturn module.exports;");
    let out = ctx
        .run(RunRequest::new("JavaScript", body).source(source))
        .await
        .unwrap();
    assert_eq!(out.value, json!({ "total": 42 }));
    ctx.run(RunRequest::new("Params", "return 1;")).await.unwrap();

    let entries = logger.entries.lock().unwrap().clone();
    assert_eq!(entries[0].code_preview, source);
    assert_eq!(entries[0].code_hash, sha256_hex(source));
    assert_eq!(entries[1].code_hash, sha256_hex("return 1;"));
}
