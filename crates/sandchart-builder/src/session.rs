//! Build orchestration: one session, one context, many stages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};

use sandchart_config::SandchartConfig;
use sandchart_sandbox::{
    ExecutionContext, HookDispatcher, LogLine, NoHooks, RunKind, RunRequest, Sandbox,
    SandboxConfig, SandboxError,
};

use crate::fragment::{FragmentInput, FragmentResult, FragmentRunner, SideEffects};
use crate::module_loader::{LoadedModule, ModuleGlobals, ModuleLoader};
use crate::resolver::{DependencyResolver, ResolveRequest, StaticResolver};
use crate::stage::{select_library, ConfigTabs, Stage, StageTimeouts, EMPTY_JS_MODULE};
use crate::{BuildError, ChartConfig};

/// Default heap ceiling of a session context in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 128;

/// Default time budget for loading all modules of a session.
pub const DEFAULT_MODULE_BUDGET: Duration = Duration::from_secs(5);

const SETUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct BuildLimits {
    /// Heap ceiling of the session context in megabytes.
    pub memory_limit_mb: usize,
    /// Total time budget for loading dependency modules.
    pub module_budget: Duration,
    /// Per-stage deadlines.
    pub timeouts: StageTimeouts,
    /// Chart type → config-tab field table.
    pub config_tabs: ConfigTabs,
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            module_budget: DEFAULT_MODULE_BUDGET,
            timeouts: StageTimeouts::default(),
            config_tabs: ConfigTabs::default(),
        }
    }
}

impl BuildLimits {
    /// Defaults with configured overrides applied.
    pub fn from_config(config: &SandchartConfig) -> Self {
        let d = Self::default();
        Self {
            memory_limit_mb: config.sandbox.memory_limit_mb.unwrap_or(d.memory_limit_mb),
            module_budget: config
                .sandbox
                .module_budget_ms
                .map(Duration::from_millis)
                .unwrap_or(d.module_budget),
            timeouts: StageTimeouts::from_overrides(&config.timeouts),
            config_tabs: ConfigTabs::with_overrides(&config.config_tabs),
        }
    }
}

/// Build a [`SandboxConfig`] from configured overrides.
pub fn sandbox_config(config: &SandchartConfig) -> SandboxConfig {
    let overrides = &config.sandbox;
    let mut sandbox = SandboxConfig::default();
    if let Some(mb) = overrides.memory_limit_mb {
        sandbox.memory_limit = mb.saturating_mul(1024 * 1024);
    }
    if let Some(max) = overrides.max_concurrent_sessions {
        sandbox.max_concurrent = max;
    }
    if let Some(kb) = overrides.max_code_size_kb {
        sandbox.max_code_size = kb.saturating_mul(1024);
    }
    if let Some(kb) = overrides.max_output_size_kb {
        sandbox.max_output_size = kb.saturating_mul(1024);
    }
    if let Some(calls) = overrides.max_hook_calls {
        sandbox.max_hook_calls = calls;
    }
    sandbox
}

/// Request-independent inputs of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Requesting user.
    pub user_login: Option<String>,
    /// Requesting user's language.
    pub user_lang: Option<String>,
    /// Whether the request comes from the screenshot renderer.
    pub is_screenshoter: bool,
    /// Workbook the chart belongs to.
    pub workbook_id: Option<String>,
    /// Dashboard widget config.
    pub widget_config: Option<Value>,
}

/// Per-stage inputs.
#[derive(Clone)]
pub struct BuildOptions {
    /// Request parameters.
    pub params: Value,
    /// Action parameters.
    pub action_params: Value,
    /// Loaded data.
    pub data: Option<Value>,
    /// Data-source statistics.
    pub data_stats: Option<Value>,
    /// Host capabilities.
    pub hooks: Arc<dyn HookDispatcher>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            params: Value::Object(Map::new()),
            action_params: Value::Object(Map::new()),
            data: None,
            data_stats: None,
            hooks: Arc::new(NoHooks),
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage label.
    pub name: String,
    /// `module.exports` of the fragment.
    pub exports: Value,
    /// Captured console output.
    pub logs: Vec<LogLine>,
    /// Wall-clock run time in milliseconds.
    pub runtime_ms: u64,
    /// `ChartEditor` effects.
    #[serde(skip_serializing_if = "SideEffects::is_empty")]
    pub side_effects: SideEffects,
}

impl From<FragmentResult> for StageResult {
    fn from(result: FragmentResult) -> Self {
        Self {
            name: result.filename,
            exports: result.exports,
            logs: result.logs,
            runtime_ms: result.runtime.as_millis() as u64,
            side_effects: result.side_effects,
        }
    }
}

/// Opens build sessions.
///
/// Holds the [`Sandbox`] that bounds live contexts, the session limits, the
/// dependency resolver and the host's native modules.
pub struct ChartBuilder {
    sandbox: Arc<Sandbox>,
    limits: BuildLimits,
    resolver: Arc<dyn DependencyResolver>,
    native_modules: Map<String, Value>,
}

impl ChartBuilder {
    /// A builder with default limits and no dependencies.
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            limits: BuildLimits::default(),
            resolver: Arc::new(StaticResolver::empty()),
            native_modules: Map::new(),
        }
    }

    /// A builder whose sandbox and limits follow `config`.
    pub fn from_config(config: &SandchartConfig) -> Self {
        Self::new(Arc::new(Sandbox::new(sandbox_config(config))))
            .with_limits(BuildLimits::from_config(config))
    }

    /// Override the session limits.
    pub fn with_limits(mut self, limits: BuildLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Resolve dependencies with `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Host-provided modules every session can `require`.
    pub fn with_native_modules(mut self, modules: Map<String, Value>) -> Self {
        self.native_modules = modules;
        self
    }

    /// The session limits.
    pub fn limits(&self) -> &BuildLimits {
        &self.limits
    }

    /// Allocate a context for `config` and return the session owning it.
    ///
    /// Fails with [`BuildError::ResourceExhausted`] when the context cannot
    /// be allocated.
    pub async fn open(
        &self,
        config: ChartConfig,
        options: SessionOptions,
    ) -> Result<BuildSession, BuildError> {
        let memory_limit = self.limits.memory_limit_mb.saturating_mul(1024 * 1024);
        let context = self
            .sandbox
            .create_with_memory_limit(memory_limit)
            .await
            .map_err(BuildError::ResourceExhausted)?;

        tracing::info!(
            chart = %config.key,
            stype = %config.stype(),
            context_id = %context.id(),
            memory_limit_mb = self.limits.memory_limit_mb,
            "build session opened"
        );

        let mut session = BuildSession {
            config,
            options,
            limits: self.limits.clone(),
            resolver: self.resolver.clone(),
            context,
            shared_loaded: false,
            stage_ran: false,
            modules: Vec::new(),
        };

        if !self.native_modules.is_empty() {
            let install = RunRequest::new(
                "natives",
                "for (const [name, value] of Object.entries(natives)) host.registerNative(name, value);",
            )
            .kind(RunKind::Setup)
            .timeout(SETUP_TIMEOUT)
            .global("natives", Value::Object(self.native_modules.clone()));
            if let Err(e) = session.context.run(install).await {
                session.close().await;
                return Err(BuildError::from_setup(e));
            }
        }

        Ok(session)
    }
}

/// One chart build.
///
/// Owns exactly one execution context, released by [`BuildSession::close`]
/// or, failing that, when the session is dropped.
pub struct BuildSession {
    config: ChartConfig,
    options: SessionOptions,
    limits: BuildLimits,
    resolver: Arc<dyn DependencyResolver>,
    context: ExecutionContext,
    shared_loaded: bool,
    stage_ran: bool,
    modules: Vec<String>,
}

impl BuildSession {
    /// The chart being built.
    pub fn config(&self) -> &ChartConfig {
        &self.config
    }

    /// Names of the modules loaded so far, in load order.
    pub fn loaded_modules(&self) -> &[String] {
        &self.modules
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.context.is_released()
    }

    /// Resolution request carrying this session's workbook.
    pub fn resolve_request(&self) -> ResolveRequest {
        ResolveRequest {
            workbook_id: self.options.workbook_id.clone(),
            ..Default::default()
        }
    }

    fn ensure_open(&self) -> Result<(), BuildError> {
        if self.is_closed() {
            return Err(BuildError::InvalidState(
                "the build session has been closed".into(),
            ));
        }
        Ok(())
    }

    /// Parse the chart's shared-state blob and install it into the context.
    ///
    /// Runs once; later calls are no-ops.
    pub async fn load_shared(&mut self) -> Result<(), BuildError> {
        self.ensure_open()?;
        if self.shared_loaded {
            return Ok(());
        }
        let shared = self.config.parse_shared()?;
        let install = RunRequest::new("shared", "host.setShared(shared);")
            .kind(RunKind::Setup)
            .timeout(SETUP_TIMEOUT)
            .global("shared", shared);
        self.context
            .run(install)
            .await
            .map_err(BuildError::from_setup)?;
        self.shared_loaded = true;
        tracing::debug!(chart = %self.config.key, "shared state installed");
        Ok(())
    }

    /// Resolve the chart's dependencies and load them in order.
    ///
    /// `on_each` is called after every successful load. The first failure
    /// aborts the remaining loads. All modules share one time budget; each
    /// module runs with whatever is left of it. Rejected once any stage has
    /// run.
    pub async fn load_modules<F>(
        &mut self,
        request: &ResolveRequest,
        mut on_each: F,
    ) -> Result<Vec<LoadedModule>, BuildError>
    where
        F: FnMut(&LoadedModule),
    {
        self.ensure_open()?;
        if self.stage_ran {
            return Err(BuildError::InvalidState(
                "modules must be loaded before any stage runs".into(),
            ));
        }

        let resolved = self.resolver.resolve(&self.config, request).await?;
        tracing::info!(
            chart = %self.config.key,
            modules = resolved.len(),
            "loading modules"
        );

        let globals = ModuleGlobals {
            user_login: self.options.user_login.clone(),
            user_lang: self.options.user_lang.clone(),
            is_screenshoter: self.options.is_screenshoter,
        };
        let budget = self.limits.module_budget;
        let deadline = Instant::now() + budget;
        let mut loaded = Vec::with_capacity(resolved.len());

        for module in &resolved {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BuildError::ModuleLoad {
                    name: module.name.clone(),
                    cause: SandboxError::Timeout {
                        timeout_ms: budget.as_millis() as u64,
                    },
                });
            }

            let module_result =
                match ModuleLoader::load(&mut self.context, module, &globals, remaining).await {
                    Ok(loaded) => loaded,
                    Err(cause) => {
                        let cause = match cause {
                            SandboxError::Timeout { .. } => SandboxError::Timeout {
                                timeout_ms: budget.as_millis() as u64,
                            },
                            other => other,
                        };
                        let err = BuildError::ModuleLoad {
                            name: module.name.clone(),
                            cause,
                        };
                        tracing::warn!(module = %module.name, error = %err, "module load failed");
                        return Err(err);
                    }
                };

            tracing::debug!(
                module = %module_result.name,
                runtime_ms = module_result.runtime_ms,
                "module loaded"
            );
            on_each(&module_result);
            self.modules.push(module_result.name.clone());
            loaded.push(module_result);
        }

        Ok(loaded)
    }

    /// Run `code` as `stage` with an explicit deadline.
    pub async fn build_fragment(
        &mut self,
        stage: Stage,
        code: &str,
        timeout: Duration,
        options: &BuildOptions,
    ) -> Result<StageResult, BuildError> {
        self.ensure_open()?;
        self.stage_ran = true;

        let label = stage.label();
        tracing::info!(chart = %self.config.key, stage = label, "stage: starting");

        let input = FragmentInput {
            name: label.to_string(),
            code: code.to_string(),
            timeout,
            params: options.params.clone(),
            action_params: options.action_params.clone(),
            widget_config: self.options.widget_config.clone().unwrap_or(Value::Null),
            data: if stage.receives_data() {
                options.data.clone().unwrap_or(Value::Null)
            } else {
                Value::Null
            },
            data_stats: if stage.receives_data_stats() {
                options.data_stats.clone().unwrap_or(Value::Null)
            } else {
                Value::Null
            },
            hooks: options.hooks.clone(),
            user_login: self.options.user_login.clone(),
            user_lang: self.options.user_lang.clone(),
            is_screenshoter: self.options.is_screenshoter,
        };

        match FragmentRunner::run(&mut self.context, input).await {
            Ok(result) => {
                let result = StageResult::from(result);
                tracing::info!(
                    chart = %self.config.key,
                    stage = label,
                    runtime_ms = result.runtime_ms,
                    "stage: complete"
                );
                Ok(result)
            }
            Err(e) => {
                let err = BuildError::from_stage(label, e);
                tracing::warn!(chart = %self.config.key, stage = label, error = %err, "stage: failed");
                Err(err)
            }
        }
    }

    async fn build_stage(
        &mut self,
        stage: Stage,
        code: &str,
        options: &BuildOptions,
    ) -> Result<StageResult, BuildError> {
        let timeout = self.limits.timeouts.for_stage(stage);
        self.build_fragment(stage, code, timeout, options).await
    }

    /// Run the `params` fragment.
    pub async fn build_params(&mut self, options: &BuildOptions) -> Result<StageResult, BuildError> {
        let code = self.config.fragment("params").unwrap_or("").to_string();
        self.build_stage(Stage::Params, &code, options).await
    }

    /// Run the `url` fragment.
    pub async fn build_urls(&mut self, options: &BuildOptions) -> Result<StageResult, BuildError> {
        let code = self.config.fragment("url").unwrap_or("").to_string();
        self.build_stage(Stage::Urls, &code, options).await
    }

    /// Run the chart-library config fragment (`graph`, else `map`, else
    /// `ymap`). Returns `None` without running anything when the chart has
    /// none of them.
    pub async fn build_library_config(
        &mut self,
        options: &BuildOptions,
    ) -> Result<Option<StageResult>, BuildError> {
        let Some((library, code)) = select_library(&self.config) else {
            tracing::debug!(chart = %self.config.key, "no library config fragment");
            return Ok(None);
        };
        let code = code.to_string();
        self.build_stage(Stage::LibraryConfig(library), &code, options)
            .await
            .map(Some)
    }

    /// Run the config tab mapped from the chart type.
    pub async fn build_chart_config(
        &mut self,
        options: &BuildOptions,
    ) -> Result<StageResult, BuildError> {
        let code = self.limits.config_tabs.source(&self.config).to_string();
        self.build_stage(Stage::Config, &code, options).await
    }

    /// Run the `js` fragment, or an empty-export stub when there is none.
    pub async fn build_chart(&mut self, options: &BuildOptions) -> Result<StageResult, BuildError> {
        let code = self
            .config
            .fragment("js")
            .unwrap_or(EMPTY_JS_MODULE)
            .to_string();
        self.build_stage(Stage::JavaScript, &code, options).await
    }

    /// Run the `ui` fragment.
    pub async fn build_ui(&mut self, options: &BuildOptions) -> Result<StageResult, BuildError> {
        let code = self.config.fragment("ui").unwrap_or("").to_string();
        self.build_stage(Stage::Ui, &code, options).await
    }

    /// Release the context. Returns `false` if it was already released.
    pub async fn close(&mut self) -> bool {
        let released = self.context.release().await;
        if released {
            tracing::info!(chart = %self.config.key, "build session closed");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn limits_follow_config() {
        let config = SandchartConfig::from_toml(
            r#"
            [sandbox]
            memory_limit_mb = 64
            module_budget_ms = 2500

            [timeouts]
            javascript_ms = 3000

            [config_tabs]
            custom_node = "settings"
            "#,
        )
        .unwrap();
        let limits = BuildLimits::from_config(&config);
        assert_eq!(limits.memory_limit_mb, 64);
        assert_eq!(limits.module_budget, Duration::from_millis(2500));
        assert_eq!(limits.timeouts.javascript, Duration::from_millis(3000));
        assert_eq!(limits.config_tabs.field_for("custom_node"), Some("settings"));
    }

    #[test]
    fn sandbox_config_follows_overrides() {
        let config = SandchartConfig::from_toml(
            r#"
            [sandbox]
            memory_limit_mb = 32
            max_concurrent_sessions = 4
            max_code_size_kb = 10
            max_hook_calls = 7
            "#,
        )
        .unwrap();
        let sandbox = sandbox_config(&config);
        assert_eq!(sandbox.memory_limit, 32 * 1024 * 1024);
        assert_eq!(sandbox.max_concurrent, 4);
        assert_eq!(sandbox.max_code_size, 10 * 1024);
        assert_eq!(sandbox.max_hook_calls, 7);
    }

    #[test]
    fn oversized_overrides_saturate() {
        let mut config = SandchartConfig::default();
        config.sandbox.memory_limit_mb = Some(usize::MAX);
        config.sandbox.max_output_size_kb = Some(usize::MAX / 2);
        let sandbox = sandbox_config(&config);
        assert_eq!(sandbox.memory_limit, usize::MAX);
        assert_eq!(sandbox.max_output_size, usize::MAX);
    }

    #[test]
    fn defaults() {
        let limits = BuildLimits::default();
        assert_eq!(limits.memory_limit_mb, 128);
        assert_eq!(limits.module_budget, Duration::from_secs(5));
        assert_eq!(limits.config_tabs, ConfigTabs::with_overrides(&HashMap::new()));
    }

    #[test]
    fn stage_result_renames_filename() {
        let result = StageResult::from(FragmentResult {
            exports: Value::Null,
            filename: "Highcharts".into(),
            logs: Vec::new(),
            runtime: Duration::from_millis(12),
            side_effects: SideEffects::default(),
        });
        assert_eq!(result.name, "Highcharts");
        assert_eq!(result.runtime_ms, 12);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("side_effects").is_none());
        assert_eq!(json["name"], "Highcharts");
    }
}
