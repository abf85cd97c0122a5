//! Long-lived execution contexts.
//!
//! An [`ExecutionContext`] owns one V8 isolate for the duration of a chart
//! build. Unlike a one-shot executor, the JavaScript heap survives between
//! runs: modules registered by one run can be `require`d by the next, and the
//! shared-state object installed once is the same object every later run
//! sees.
//!
//! V8 isolates are `!Send`, so each context pins its `JsRuntime` to a
//! dedicated thread with its own single-threaded tokio runtime and talks to it
//! over a command channel. The public API is fully async and `Send`-safe.

use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::audit::{
    AuditEntryBuilder, AuditLogger, AuditingHookDispatcher, HookCallAudit, NoopAuditLogger,
    RunKind,
};
use crate::error::SandboxError;
#[cfg(feature = "metrics")]
use crate::metrics::SandboxMetrics;
use crate::ops::{sandchart_ext, AbandonedRuns, ActiveRun, AMBIENT_RUN_ID};
use crate::validator::{is_js_identifier, validate_source, DEFAULT_MAX_CODE_SIZE};
use crate::{HookDispatcher, NoHooks};

/// Run ids must fit in a V8 small integer.
const RUN_ID_MASK: u32 = 0x3fff_ffff;

/// Configuration shared by every context a [`Sandbox`] creates.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// V8 heap ceiling per context, in bytes.
    pub memory_limit: usize,
    /// Maximum number of live contexts.
    pub max_concurrent: usize,
    /// Maximum size of a run body in bytes.
    pub max_code_size: usize,
    /// Maximum size of a serialized run result in bytes.
    pub max_output_size: usize,
    /// Maximum hook calls per run.
    pub max_hook_calls: usize,
    /// Maximum size of serialized hook arguments in bytes.
    pub max_hook_args_size: usize,
    /// Maximum console lines captured per run.
    pub max_log_lines: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 128 * 1024 * 1024, // 128 MB
            max_concurrent: 16,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_output_size: 4 * 1024 * 1024, // 4 MB
            max_hook_calls: 50,
            max_hook_args_size: 1024 * 1024, // 1 MB
            max_log_lines: 1000,
        }
    }
}

/// Severity of a captured console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug`
    Debug,
    /// `console.log` and `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogLevel {
    /// Parse the level name sent by the JavaScript console shim.
    ///
    /// Unknown names map to [`LogLevel::Info`].
    pub fn parse(level: &str) -> Self {
        match level {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// A console line captured from sandboxed code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Console method that produced the line.
    pub level: LogLevel,
    /// Formatted message.
    pub message: String,
}

/// A single unit of work for an [`ExecutionContext`].
///
/// `body` is the statement list of an async function. It receives a `host`
/// parameter plus one parameter per entry of `globals`, and whatever it
/// returns becomes [`RunOutput::value`]. The `host` object exposes:
///
/// - `register(name, exports)` / `registerNative(name, exports)`: add to the
///   module registry
/// - `require(name)`: look up a registered module
/// - `shared()` / `setShared(value)`: the context-wide shared-state slot
/// - `hooks`: proxy routing `hooks.<name>(args)` to the [`HookDispatcher`]
/// - `console`: the capturing console
///
/// `console` is also bound as a parameter so that lines are attributed to
/// the run that wrote them.
#[derive(Clone)]
pub struct RunRequest {
    /// Stage or module name, used in logs and audit entries.
    pub label: String,
    /// Async function body.
    pub body: String,
    /// Author-written code the body was generated from, when it differs.
    /// Audit entries hash and preview this instead of `body`.
    pub source: Option<String>,
    /// Values bound as function parameters.
    pub globals: Map<String, Value>,
    /// Wall-clock deadline for the whole run.
    pub timeout: Duration,
    /// Host capabilities reachable through `host.hooks`.
    pub hooks: Arc<dyn HookDispatcher>,
    /// What kind of code this is.
    pub kind: RunKind,
}

impl RunRequest {
    /// A fragment run with no globals, no hooks and a one second deadline.
    pub fn new(label: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            body: body.into(),
            source: None,
            globals: Map::new(),
            timeout: Duration::from_secs(1),
            hooks: Arc::new(NoHooks),
            kind: RunKind::Fragment,
        }
    }

    /// Bind a single parameter.
    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Bind every entry of `globals` as a parameter.
    pub fn globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals.extend(globals);
        self
    }

    /// Set the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the hook dispatcher.
    pub fn hooks(mut self, hooks: Arc<dyn HookDispatcher>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the run kind.
    pub fn kind(mut self, kind: RunKind) -> Self {
        self.kind = kind;
        self
    }

    /// Record the author-written code behind a generated body.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// The settled outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The JSON value returned by the body (`null` for `undefined`).
    pub value: Value,
    /// Captured console output.
    pub logs: Vec<LogLine>,
    /// Wall-clock time the run took.
    pub duration: Duration,
}

/// Factory for [`ExecutionContext`]s.
///
/// A semaphore bounds the number of live contexts. Each context thread owns
/// its permit and returns it only after the isolate has been torn down, so a
/// free permit always means a free isolate slot.
pub struct Sandbox {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl Sandbox {
    /// Create a sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a sandbox that reports every run to `logger`.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record run counts and durations into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configuration contexts are created with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of contexts that can still be created.
    pub fn available_contexts(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Create a context with the configured memory ceiling.
    pub async fn create(&self) -> Result<ExecutionContext, SandboxError> {
        self.create_with_memory_limit(self.config.memory_limit).await
    }

    /// Create a context with an explicit heap ceiling in bytes.
    ///
    /// Fails with [`SandboxError::ConcurrencyLimit`] when every permit is
    /// taken and with [`SandboxError::ContextAllocation`] when the isolate or
    /// its thread cannot be brought up.
    pub async fn create_with_memory_limit(
        &self,
        memory_limit: usize,
    ) -> Result<ExecutionContext, SandboxError> {
        let permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let limits = RunLimits {
            max_output_size: self.config.max_output_size,
            max_hook_calls: self.config.max_hook_calls,
            max_hook_args_size: self.config.max_hook_args_size,
            max_log_lines: self.config.max_log_lines,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(format!("sandchart-{}", &id[..8]))
            .spawn(move || context_thread(permit, memory_limit, limits, ready_tx, rx))
            .map_err(|e| SandboxError::ContextAllocation {
                reason: format!("failed to spawn context thread: {e}"),
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SandboxError::ContextAllocation {
                    reason: "context thread exited during startup".into(),
                })
            }
        }

        tracing::debug!(context_id = %id, memory_limit, "execution context created");
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.live_contexts.inc();
        }

        Ok(ExecutionContext {
            id,
            tx: Some(tx),
            thread: Some(thread),
            max_code_size: self.config.max_code_size,
            audit_logger: self.audit_logger.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        })
    }
}

/// Handle to a live isolate.
///
/// Runs take `&mut self`, so one context is never driven concurrently.
/// [`ExecutionContext::release`] tears the isolate down and waits for it;
/// dropping the handle starts the same teardown without waiting, so the
/// concurrency permit comes back once the context thread has exited.
pub struct ExecutionContext {
    id: String,
    tx: Option<mpsc::UnboundedSender<Command>>,
    thread: Option<std::thread::JoinHandle<()>>,
    max_code_size: usize,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ExecutionContext {
    /// Unique identifier of this context.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether [`ExecutionContext::release`] has run.
    pub fn is_released(&self) -> bool {
        self.tx.is_none()
    }

    /// Run a body inside the context.
    ///
    /// A run that misses its deadline is terminated and fails with
    /// [`SandboxError::Timeout`]; the context stays usable. A run that hits
    /// the heap ceiling fails with [`SandboxError::HeapLimitExceeded`] and so
    /// does every later run.
    pub async fn run(&mut self, request: RunRequest) -> Result<RunOutput, SandboxError> {
        let tx = self.tx.as_ref().ok_or(SandboxError::Released)?;

        tracing::debug!(
            context_id = %self.id,
            label = %request.label,
            body_len = request.body.len(),
            timeout_ms = request.timeout.as_millis() as u64,
            "run: starting"
        );

        let audited_code = request.source.as_deref().unwrap_or(&request.body);
        let mut audit_builder =
            AuditEntryBuilder::new(&self.id, &request.label, request.kind, audited_code);

        validate_source(&request.body, Some(self.max_code_size))?;
        validate_globals(&request.globals)?;

        let (audit_tx, mut audit_rx) = mpsc::unbounded_channel::<HookCallAudit>();
        let hooks: Arc<dyn HookDispatcher> =
            Arc::new(AuditingHookDispatcher::new(request.hooks.clone(), audit_tx));

        let job = Job {
            body: request.body.clone(),
            globals: request.globals.clone(),
            timeout: request.timeout,
            hooks,
        };

        let start = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Run {
            job,
            reply: reply_tx,
        })
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("execution context thread exited")))?;

        let result = reply_rx
            .await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("execution context thread panicked")))
            .and_then(|r| r)
            .map(|settled| RunOutput {
                value: settled.value,
                logs: settled.logs,
                duration: start.elapsed(),
            });

        while let Ok(call) = audit_rx.try_recv() {
            audit_builder.record_hook_call(call);
        }
        if let Ok(output) = &result {
            audit_builder.log_lines(output.logs.len());
        }
        let entry = audit_builder.finish(result.as_ref().map(|o| &o.value));
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            let stage = match request.kind {
                RunKind::Fragment => request.label.as_str(),
                RunKind::Module => "module",
                RunKind::Setup => "setup",
            };
            match &result {
                Ok(output) => m.record_run(stage, output.duration.as_secs_f64()),
                Err(e) => m.record_error(stage, e.kind()),
            }
        }

        match &result {
            Ok(output) => tracing::debug!(
                context_id = %self.id,
                label = %request.label,
                runtime_ms = output.duration.as_millis() as u64,
                "run: complete"
            ),
            Err(e) => tracing::warn!(
                context_id = %self.id,
                label = %request.label,
                error = %e,
                "run: failed"
            ),
        }

        result
    }

    /// Tear down the isolate and return the concurrency permit.
    ///
    /// Returns `true` if this call released the context, `false` if it was
    /// already released.
    pub async fn release(&mut self) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Command::Release { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        drop(tx);
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.live_contexts.dec();
        }

        tracing::debug!(context_id = %self.id, "execution context released");
        true
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Closing the channel ends the thread's command loop, which drops
        // the isolate and then the permit.
        if self.tx.take().is_none() {
            return;
        }
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.live_contexts.dec();
        }
        tracing::debug!(context_id = %self.id, "execution context dropped without release");
    }
}

/// Parameter names every body receives.
const RESERVED_PARAMS: [&str; 2] = ["host", "console"];

fn validate_globals(globals: &Map<String, Value>) -> Result<(), SandboxError> {
    for name in globals.keys() {
        if RESERVED_PARAMS.contains(&name.as_str()) || !is_js_identifier(name) {
            return Err(SandboxError::ValidationFailed {
                reason: format!("'{name}' cannot be bound as a parameter name"),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct RunLimits {
    max_output_size: usize,
    max_hook_calls: usize,
    max_hook_args_size: usize,
    max_log_lines: usize,
}

struct Job {
    body: String,
    globals: Map<String, Value>,
    timeout: Duration,
    hooks: Arc<dyn HookDispatcher>,
}

struct Settled {
    value: Value,
    logs: Vec<LogLine>,
}

enum Command {
    Run {
        job: Job,
        reply: oneshot::Sender<Result<Settled, SandboxError>>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
}

/// Body of the dedicated context thread.
fn context_thread(
    permit: OwnedSemaphorePermit,
    memory_limit: usize,
    limits: RunLimits,
    ready: oneshot::Sender<Result<(), SandboxError>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(SandboxError::ContextAllocation {
                reason: format!("failed to build context runtime: {e}"),
            }));
            return;
        }
    };

    rt.block_on(async move {
        let created = std::panic::catch_unwind(AssertUnwindSafe(|| IsolateHost::new(memory_limit)));
        let mut host = match created {
            Ok(Ok(host)) => host,
            Ok(Err(e)) => {
                let _ = ready.send(Err(e));
                return;
            }
            Err(_) => {
                let _ = ready.send(Err(SandboxError::ContextAllocation {
                    reason: "isolate construction panicked".into(),
                }));
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            return;
        }

        while let Some(command) = rx.recv().await {
            match command {
                Command::Run { job, reply } => {
                    let result = host.run(job, &limits).await;
                    if reply.send(result).is_err() {
                        tracing::warn!("run result receiver dropped");
                    }
                }
                Command::Release { reply } => {
                    drop(host);
                    drop(permit);
                    let _ = reply.send(());
                    return;
                }
            }
        }
        drop(host);
        drop(permit);
    });
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the `HeapLimitState` boxed in `IsolateHost`,
    // which is declared after `runtime` and therefore outlives the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// The isolate and its bookkeeping, owned by the context thread.
struct IsolateHost {
    // Must drop before `heap_state`.
    runtime: JsRuntime,
    heap_state: Box<HeapLimitState>,
    poisoned: bool,
    next_run_id: u32,
}

impl IsolateHost {
    fn new(memory_limit: usize) -> Result<Self, SandboxError> {
        let create_params = v8::CreateParams::default().heap_limits(0, memory_limit);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![sandchart_ext::init()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        runtime.op_state().borrow_mut().put(AbandonedRuns::default());
        runtime
            .execute_script("[sandchart:bootstrap]", BOOTSTRAP)
            .map_err(|e| SandboxError::ContextAllocation {
                reason: format!("bootstrap failed: {e}"),
            })?;

        Ok(Self {
            runtime,
            heap_state,
            poisoned: false,
            next_run_id: 0,
        })
    }

    async fn run(&mut self, job: Job, limits: &RunLimits) -> Result<Settled, SandboxError> {
        if self.poisoned {
            return Err(SandboxError::HeapLimitExceeded);
        }

        let run_id = self.allocate_run_id();
        let result = self.execute(run_id, job, limits).await;
        if result.is_err() {
            self.abandoned_runs(|abandoned| {
                abandoned.insert(run_id);
            });
        }
        result
    }

    /// Next run id, never the ambient console's id. A reused id stops being
    /// abandoned.
    fn allocate_run_id(&mut self) -> u32 {
        self.next_run_id = (self.next_run_id + 1) & RUN_ID_MASK;
        if self.next_run_id == AMBIENT_RUN_ID {
            self.next_run_id += 1;
        }
        let run_id = self.next_run_id;
        self.abandoned_runs(|abandoned| {
            abandoned.remove(&run_id);
        });
        run_id
    }

    fn abandoned_runs(&mut self, f: impl FnOnce(&mut std::collections::HashSet<u32>)) {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();
        if let Some(abandoned) = state.try_borrow_mut::<AbandonedRuns>() {
            f(&mut abandoned.0);
        }
    }

    async fn execute(&mut self, run_id: u32, job: Job, limits: &RunLimits) -> Result<Settled, SandboxError> {
        let script = wrap_body(run_id, &job.body, &job.globals)?;

        self.runtime.op_state().borrow_mut().put(ActiveRun {
            id: run_id,
            hooks: job.hooks,
            max_hook_calls: limits.max_hook_calls,
            max_hook_args_size: limits.max_hook_args_size,
            hook_calls_made: 0,
            max_log_lines: limits.max_log_lines,
            logs: Vec::new(),
            dropped_log_lines: 0,
            result: None,
        });

        // --- CPU watchdog ---
        let watchdog_handle = self.runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = timed_out.clone();
        let timeout = job.timeout;
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        // --- Execute and drive the event loop until this run settles ---
        let mut deadline_elapsed = false;
        let exec_error = match self.runtime.execute_script("[sandchart:run]", script) {
            Ok(_) => {
                let runtime = &mut self.runtime;
                let settle = poll_fn(|cx| poll_until_settled(runtime, cx));
                match tokio::time::timeout(timeout, settle).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => {
                        deadline_elapsed = true;
                        None
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        };

        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        let run = self.runtime.op_state().borrow_mut().try_take::<ActiveRun>();

        if self.heap_state.triggered.load(Ordering::SeqCst) {
            self.poisoned = true;
            return Err(SandboxError::HeapLimitExceeded);
        }

        if deadline_elapsed || timed_out.load(Ordering::SeqCst) {
            self.runtime.v8_isolate().cancel_terminate_execution();
            return Err(SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let run = run.ok_or_else(|| {
            SandboxError::Execution(anyhow::anyhow!("run state missing after execution"))
        })?;
        if run.dropped_log_lines > 0 {
            tracing::warn!(
                dropped = run.dropped_log_lines,
                max = limits.max_log_lines,
                "console output truncated"
            );
        }

        if let Some(message) = exec_error {
            return Err(SandboxError::JsError {
                message,
                stack: None,
            });
        }

        let result = run.result.ok_or_else(|| SandboxError::JsError {
            message: "run finished without settling (a promise was never resolved)".into(),
            stack: None,
        })?;

        if result.len() > limits.max_output_size {
            return Err(SandboxError::OutputTooLarge {
                max: limits.max_output_size,
            });
        }

        let envelope: Value = serde_json::from_str(&result)?;
        if let Some(error) = envelope.get("error") {
            return Err(SandboxError::JsError {
                message: error.as_str().unwrap_or("unknown error").to_string(),
                stack: envelope
                    .get("stack")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        Ok(Settled {
            value: envelope.get("ok").cloned().unwrap_or(Value::Null),
            logs: run.logs,
        })
    }
}

/// Poll the event loop until the active run has stored its result.
///
/// Work left pending by earlier timed-out runs does not hold this run up.
fn poll_until_settled(runtime: &mut JsRuntime, cx: &mut Context<'_>) -> Poll<Result<(), String>> {
    if run_settled(runtime) {
        return Poll::Ready(Ok(()));
    }
    match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
        Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
        Poll::Ready(Err(e)) if !run_settled(runtime) => Poll::Ready(Err(e.to_string())),
        Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
        Poll::Pending if run_settled(runtime) => Poll::Ready(Ok(())),
        Poll::Pending => Poll::Pending,
    }
}

fn run_settled(runtime: &mut JsRuntime) -> bool {
    let state = runtime.op_state();
    let settled = state
        .borrow()
        .try_borrow::<ActiveRun>()
        .is_some_and(|run| run.result.is_some());
    settled
}

/// Wrap a run body in an async function bound to its globals.
fn wrap_body(run_id: u32, body: &str, globals: &Map<String, Value>) -> Result<String, SandboxError> {
    let globals_json = serde_json::to_string(globals)?;
    let mut params = String::from("host, console");
    let mut args = String::from("__host, __host.console");
    for name in globals.keys() {
        params.push_str(", ");
        params.push_str(name);
        args.push_str(", __globals[");
        args.push_str(&serde_json::to_string(name)?);
        args.push(']');
    }

    Ok(format!(
        r#"(async () => {{
    const __runId = {run_id};
    const __host = globalThis.__sandchart.hostFor(__runId);
    try {{
        const __globals = {globals_json};
        const __body = async function ({params}) {{
{body}
        }};
        const __value = await __body({args});
        globalThis.__sandchart.finish(__runId, {{ ok: __value === undefined ? null : __value }});
    }} catch (e) {{
        const message = e && e.message !== undefined ? String(e.message) : String(e);
        const stack = e && typeof e.stack === 'string' ? e.stack : undefined;
        globalThis.__sandchart.finish(__runId, {{ error: message, stack }});
    }}
}})();
"#
    ))
}

/// Installed once per isolate: console shim, module registry, shared-state
/// slot and per-run host objects, then removal of runtime escapes.
const BOOTSTRAP: &str = r#"
((core) => {
    const ops = core.ops;
    const logOp = (runId, level, msg) => ops.op_sandchart_log(runId, level, msg);
    const setResult = (runId, json) => ops.op_sandchart_set_result(runId, json);
    const callHookOp = ops.op_sandchart_call_hook;

    const format = (args) => args.map((a) => {
        if (typeof a === 'string') return a;
        try {
            const s = JSON.stringify(a);
            return s === undefined ? String(a) : s;
        } catch (_) {
            return String(a);
        }
    }).join(' ');

    const consoleFor = (runId) => Object.freeze({
        log: (...args) => logOp(runId, 'info', format(args)),
        info: (...args) => logOp(runId, 'info', format(args)),
        debug: (...args) => logOp(runId, 'debug', format(args)),
        warn: (...args) => logOp(runId, 'warn', format(args)),
        error: (...args) => logOp(runId, 'error', format(args)),
    });
    const ambientConsole = consoleFor(0);

    const modules = new Map();
    const natives = new Map();
    let shared = {};

    const require = (name) => {
        const key = String(name);
        if (modules.has(key)) return modules.get(key);
        if (natives.has(key)) return natives.get(key);
        throw new Error(`Cannot find module '${key}'`);
    };

    const hooksFor = (runId) => new Proxy(Object.freeze({}), {
        get(_target, name) {
            if (typeof name !== 'string' || name === 'then') return undefined;
            return async (args) => {
                const json = await callHookOp(
                    runId, name, JSON.stringify(args === undefined ? null : args)
                );
                const envelope = JSON.parse(json);
                if (envelope.error) {
                    const err = new Error(envelope.error.message);
                    err.code = envelope.error.code;
                    err.retryable = envelope.error.retryable === true;
                    throw err;
                }
                return envelope.ok;
            };
        },
    });

    const hostFor = (runId) => Object.freeze({
        register: (name, exports) => { modules.set(String(name), exports); },
        registerNative: (name, exports) => { natives.set(String(name), exports); },
        require,
        shared: () => shared,
        setShared: (value) => { shared = value; },
        hooks: hooksFor(runId),
        console: consoleFor(runId),
    });

    const finish = (runId, envelope) => {
        let json;
        try {
            json = JSON.stringify(envelope);
        } catch (e) {
            json = JSON.stringify({
                error: 'result is not JSON-serializable: ' + String(e && e.message || e),
            });
        }
        setResult(runId, json === undefined ? '{"ok":null}' : json);
    };

    if (typeof core.setUnhandledPromiseRejectionHandler === 'function') {
        core.setUnhandledPromiseRejectionHandler((_promise, reason) => {
            logOp(0, 'error', 'unhandled promise rejection: ' + format([reason && reason.message || reason]));
            return true;
        });
    }

    Object.defineProperty(globalThis, 'console', {
        value: ambientConsole, writable: false, configurable: false, enumerable: false,
    });
    Object.defineProperty(globalThis, '__sandchart', {
        value: Object.freeze({ hostFor, finish }),
        writable: false, configurable: false, enumerable: false,
    });

    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    const BlockedFunction = function Function() {
        throw new EvalError('code generation from strings is disabled');
    };
    BlockedFunction.prototype = Function.prototype;
    Object.defineProperty(globalThis, 'Function', {
        value: BlockedFunction, writable: false, configurable: false, enumerable: false,
    });
})(Deno.core);
"#;
