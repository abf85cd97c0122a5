#![warn(missing_docs)]

//! sandchart: build a chart config through the sandboxed stage pipeline.
//!
//! Reads a chart config, loads its dependency modules, runs every stage in
//! order and prints the stage outputs as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandchart_builder::{
    sandbox_config, BuildError, BuildLimits, BuildOptions, BuildSession, ChartBuilder,
    ChartConfig, DirectoryModuleStore, RequireGraphResolver, SessionOptions, StageResult,
};
use sandchart_config::SandchartConfig;
use sandchart_sandbox::audit::TracingAuditLogger;
use sandchart_sandbox::{HookDispatcher, HookError, Sandbox};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandchart", about = "Sandboxed chart build pipeline")]
struct Cli {
    /// Config file (defaults to $SANDCHART_CONFIG, then ./sandchart.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a chart and print every stage's exports.
    Build(BuildArgs),
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Chart config JSON file.
    chart: PathBuf,

    /// Directory holding dependency modules as `<name>.js`.
    #[arg(long)]
    modules: Option<PathBuf>,

    /// JSON file of host-provided native modules, keyed by name.
    #[arg(long)]
    natives: Option<PathBuf>,

    /// Request parameters as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,

    /// Action parameters as a JSON object.
    #[arg(long, default_value = "{}")]
    action_params: String,

    /// JSON file with loaded data, passed to the library-config, config,
    /// JavaScript and UI stages.
    #[arg(long)]
    data: Option<PathBuf>,

    /// JSON file with statistics about the loaded data.
    #[arg(long)]
    data_stats: Option<PathBuf>,

    /// JSON file with the widget configuration of the embedding dashboard.
    #[arg(long)]
    widget_config: Option<PathBuf>,

    /// JSON file of canned hook responses, keyed by hook name.
    #[arg(long)]
    hook_data: Option<PathBuf>,

    /// Requesting user.
    #[arg(long)]
    user_login: Option<String>,

    /// Requesting user's language.
    #[arg(long)]
    user_lang: Option<String>,

    /// Workbook the chart belongs to.
    #[arg(long)]
    workbook_id: Option<String>,

    /// Mark the request as coming from the screenshot renderer.
    #[arg(long)]
    screenshoter: bool,

    /// Fail on the first stage error instead of recording it.
    #[arg(long)]
    strict: bool,

    /// Pretty-print the output.
    #[arg(long)]
    pretty: bool,
}

/// Serves fixed responses from a JSON object.
struct CannedHooks {
    responses: Map<String, Value>,
}

#[async_trait::async_trait]
impl HookDispatcher for CannedHooks {
    async fn call(&self, hook: &str, _args: Value) -> Result<Value, HookError> {
        self.responses
            .get(hook)
            .cloned()
            .ok_or_else(|| HookError::HookNotFound(hook.to_string()))
    }

    fn hook_names(&self) -> Vec<String> {
        self.responses.keys().cloned().collect()
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    match read_json(path)? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} must contain a JSON object", path.display()),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<SandchartConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(sandchart_config::find_config_file);
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            SandchartConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(SandchartConfig::default())
        }
    }
}

/// Stage outputs and recorded failures of one build.
#[derive(Default)]
struct Report {
    stages: Map<String, Value>,
    errors: Map<String, Value>,
}

impl Report {
    fn record(
        &mut self,
        key: &str,
        result: Result<StageResult, BuildError>,
        strict: bool,
    ) -> Result<()> {
        match result {
            Ok(stage) => {
                self.stages
                    .insert(key.to_string(), serde_json::to_value(stage)?);
                Ok(())
            }
            Err(e) if strict => Err(e).with_context(|| format!("stage '{key}' failed")),
            Err(e) => {
                tracing::warn!(stage = key, error = %e, "stage failed");
                self.errors
                    .insert(key.to_string(), Value::String(e.to_string()));
                Ok(())
            }
        }
    }
}

async fn run_stages(
    session: &mut BuildSession,
    options: &BuildOptions,
    strict: bool,
) -> Result<(Vec<String>, Report)> {
    session
        .load_shared()
        .await
        .context("failed to load shared state")?;
    let request = session.resolve_request();
    let loaded = session
        .load_modules(&request, |m| {
            tracing::info!(module = %m.name, runtime_ms = m.runtime_ms, "module loaded")
        })
        .await
        .context("failed to load modules")?;
    let modules = loaded.into_iter().map(|m| m.name).collect();

    let mut report = Report::default();
    let params = session.build_params(options).await;
    report.record("params", params, strict)?;
    let urls = session.build_urls(options).await;
    report.record("urls", urls, strict)?;
    match session.build_library_config(options).await.transpose() {
        Some(result) => report.record("libraryConfig", result, strict)?,
        None => tracing::debug!("chart has no library config"),
    }
    let config = session.build_chart_config(options).await;
    report.record("config", config, strict)?;
    let js = session.build_chart(options).await;
    report.record("js", js, strict)?;
    let ui = session.build_ui(options).await;
    report.record("ui", ui, strict)?;

    Ok((modules, report))
}

async fn build(config: &SandchartConfig, args: BuildArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.chart)
        .with_context(|| format!("failed to read {}", args.chart.display()))?;
    let chart = ChartConfig::from_json(&text)
        .with_context(|| format!("invalid chart config {}", args.chart.display()))?;

    let natives = match &args.natives {
        Some(path) => read_object(path)?,
        None => Map::new(),
    };

    let sandbox = Sandbox::with_audit_logger(sandbox_config(config), Arc::new(TracingAuditLogger));
    let mut builder = ChartBuilder::new(Arc::new(sandbox))
        .with_limits(BuildLimits::from_config(config));
    if let Some(dir) = args.modules.clone().or_else(|| config.modules.directory.clone()) {
        tracing::info!(path = %dir.display(), "resolving modules from directory");
        let mut resolver = RequireGraphResolver::new(Arc::new(DirectoryModuleStore::new(dir)))
            .with_natives(natives.keys().cloned());
        if let Some(depth) = config.modules.max_depth {
            resolver = resolver.with_max_depth(depth);
        }
        builder = builder.with_resolver(Arc::new(resolver));
    }
    let builder = builder.with_native_modules(natives);

    let hooks: Arc<dyn HookDispatcher> = match &args.hook_data {
        Some(path) => Arc::new(CannedHooks {
            responses: read_object(path)?,
        }),
        None => Arc::new(sandchart_sandbox::NoHooks),
    };
    let options = BuildOptions {
        params: serde_json::from_str(&args.params).context("--params is not valid JSON")?,
        action_params: serde_json::from_str(&args.action_params)
            .context("--action-params is not valid JSON")?,
        data: args.data.as_deref().map(read_json).transpose()?,
        data_stats: args.data_stats.as_deref().map(read_json).transpose()?,
        hooks,
    };
    let session_options = SessionOptions {
        user_login: args.user_login,
        user_lang: args.user_lang,
        is_screenshoter: args.screenshoter,
        workbook_id: args.workbook_id,
        widget_config: args.widget_config.as_deref().map(read_json).transpose()?,
    };

    let key = chart.key.clone();
    let mut session = builder
        .open(chart, session_options)
        .await
        .context("failed to open build session")?;
    let outcome = run_stages(&mut session, &options, args.strict).await;
    session.close().await;
    let (modules, report) = outcome?;

    let mut payload = json!({
        "key": key,
        "modules": modules,
        "stages": report.stages,
    });
    if !report.errors.is_empty() {
        payload["errors"] = Value::Object(report.errors);
    }
    let out = if args.pretty {
        serde_json::to_string_pretty(&payload)?
    } else {
        serde_json::to_string(&payload)?
    };
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version / -V before anything else
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("sandchart {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Build(args) => build(&config, args).await,
    }
}
