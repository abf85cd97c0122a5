//! Runs one chart fragment as a CommonJS module inside a session context.
//!
//! A fragment sees `module`, `exports` and `require`, the request inputs
//! (`params`, `actionParams`, `widgetConfig`, `data`, `dataStats`, `userLogin`,
//! `userLang`, `isScreenshoter`), the context-wide `shared` object, the
//! `hooks` proxy and a `ChartEditor` helper. Whatever ends up in
//! `module.exports` (awaited if it is a promise) is the fragment's result.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sandchart_sandbox::{
    ExecutionContext, HookDispatcher, LogLine, RunKind, RunRequest, SandboxError,
};

/// Everything a fragment run needs besides the context.
///
/// Shared state is not part of the input: it lives in the context and every
/// fragment of a session reads and mutates the same object.
#[derive(Clone)]
pub struct FragmentInput {
    /// Stage label, reported back as the result's file name.
    pub name: String,
    /// Fragment source.
    pub code: String,
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// Request parameters.
    pub params: Value,
    /// Action parameters.
    pub action_params: Value,
    /// Dashboard widget config.
    pub widget_config: Value,
    /// Loaded data, for stages that receive it.
    pub data: Value,
    /// Data-source statistics, for stages that receive them.
    pub data_stats: Value,
    /// Host capabilities.
    pub hooks: Arc<dyn HookDispatcher>,
    /// Requesting user.
    pub user_login: Option<String>,
    /// Requesting user's language.
    pub user_lang: Option<String>,
    /// Whether the request comes from the screenshot renderer.
    pub is_screenshoter: bool,
}

/// Effects recorded through `ChartEditor` during a fragment run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffects {
    /// `ChartEditor.updateParams`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// `ChartEditor.updateActionParams`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_params: Option<Map<String, Value>>,
    /// `ChartEditor.updateConfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
    /// `ChartEditor.updateLibraryConfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_config: Option<Map<String, Value>>,
    /// `ChartEditor.setDataSourceInfo`, keyed by source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sources_infos: Option<Map<String, Value>>,
}

impl SideEffects {
    /// True when the fragment recorded nothing.
    pub fn is_empty(&self) -> bool {
        self.params.is_none()
            && self.action_params.is_none()
            && self.config.is_none()
            && self.library_config.is_none()
            && self.data_sources_infos.is_none()
    }
}

/// Outcome of a fragment run.
#[derive(Debug, Clone)]
pub struct FragmentResult {
    /// `module.exports`, as JSON.
    pub exports: Value,
    /// The stage label the fragment ran under.
    pub filename: String,
    /// Captured console output.
    pub logs: Vec<LogLine>,
    /// Wall-clock run time.
    pub runtime: Duration,
    /// `ChartEditor` effects.
    pub side_effects: SideEffects,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    exports: Value,
    #[serde(default)]
    side_effects: SideEffects,
}

/// Executes fragments in a session's context.
pub struct FragmentRunner;

impl FragmentRunner {
    /// Run `input` in `context`.
    pub async fn run(
        context: &mut ExecutionContext,
        input: FragmentInput,
    ) -> Result<FragmentResult, SandboxError> {
        let request = RunRequest::new(input.name.clone(), fragment_body(&input.code))
            .source(input.code.as_str())
            .kind(RunKind::Fragment)
            .timeout(input.timeout)
            .hooks(input.hooks.clone())
            .global("params", input.params)
            .global("actionParams", input.action_params)
            .global("widgetConfig", input.widget_config)
            .global("data", input.data)
            .global("dataStats", input.data_stats)
            .global("userLogin", input.user_login.map_or(Value::Null, Value::String))
            .global("userLang", input.user_lang.map_or(Value::Null, Value::String))
            .global("isScreenshoter", Value::Bool(input.is_screenshoter));

        let output = context.run(request).await?;
        let envelope: Envelope = serde_json::from_value(output.value)?;

        Ok(FragmentResult {
            exports: envelope.exports,
            filename: input.name,
            logs: output.logs,
            runtime: output.duration,
            side_effects: envelope.side_effects,
        })
    }
}

fn fragment_body(code: &str) -> String {
    format!(
        r#"const module = {{ exports: {{}} }};
const exports = module.exports;
const require = host.require;
const shared = host.shared();
const hooks = host.hooks;
const __sideEffects = {{}};
const __record = (key, value) => {{
    if (value === null || typeof value !== 'object') {{
        throw new TypeError(`ChartEditor: ${{key}} update must be an object`);
    }}
    __sideEffects[key] = Object.assign(__sideEffects[key] || {{}}, value);
}};
const ChartEditor = Object.freeze({{
    getParams: () => params,
    getActionParams: () => actionParams,
    getWidgetConfig: () => widgetConfig,
    getSharedData: () => shared,
    getLoadedData: () => data,
    getLoadedDataStats: () => dataStats,
    getUserLogin: () => userLogin,
    getUserLang: () => userLang,
    isScreenshoter: () => isScreenshoter,
    updateParams: (value) => __record('params', value),
    updateActionParams: (value) => __record('actionParams', value),
    updateConfig: (value) => __record('config', value),
    updateLibraryConfig: (value) => __record('libraryConfig', value),
    setDataSourceInfo: (key, info) => __record('dataSourcesInfos', {{ [String(key)]: info }}),
}});
await (async function (module, exports, require, host) {{
{code}
}})(module, exports, require, undefined);
let __exports = module.exports;
if (__exports && typeof __exports.then === 'function') {{
    __exports = await __exports;
}}
return {{ exports: __exports === undefined ? null : __exports, sideEffects: __sideEffects }};
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandchart_sandbox::{NoHooks, Sandbox, SandboxConfig};
    use serde_json::json;

    fn input(name: &str, code: &str) -> FragmentInput {
        FragmentInput {
            name: name.into(),
            code: code.into(),
            timeout: Duration::from_secs(1),
            params: json!({ "region": ["eu"] }),
            action_params: json!({}),
            widget_config: Value::Null,
            data: Value::Null,
            data_stats: Value::Null,
            hooks: Arc::new(NoHooks),
            user_login: Some("alice".into()),
            user_lang: Some("en".into()),
            is_screenshoter: false,
        }
    }

    async fn context() -> ExecutionContext {
        Sandbox::new(SandboxConfig::default()).create().await.unwrap()
    }

    #[tokio::test]
    async fn exports_are_returned() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(
            &mut ctx,
            input("Params", "module.exports = { region: params.region[0], user: userLogin };"),
        )
        .await
        .unwrap();
        assert_eq!(result.exports, json!({ "region": "eu", "user": "alice" }));
        assert_eq!(result.filename, "Params");
        assert!(result.side_effects.is_empty());
    }

    #[tokio::test]
    async fn exports_shorthand_works() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(&mut ctx, input("UI", "exports.controls = [];"))
            .await
            .unwrap();
        assert_eq!(result.exports, json!({ "controls": [] }));
    }

    #[tokio::test]
    async fn promise_exports_are_awaited() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(
            &mut ctx,
            input("JavaScript", "module.exports = Promise.resolve({ series: [1, 2] });"),
        )
        .await
        .unwrap();
        assert_eq!(result.exports, json!({ "series": [1, 2] }));
    }

    #[tokio::test]
    async fn empty_fragment_exports_empty_object() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(&mut ctx, input("UI", "")).await.unwrap();
        assert_eq!(result.exports, json!({}));
    }

    #[tokio::test]
    async fn chart_editor_records_side_effects() {
        let mut ctx = context().await;
        let code = r#"
            ChartEditor.updateParams({ region: ['us'] });
            ChartEditor.updateParams({ page: 2 });
            ChartEditor.setDataSourceInfo('sales', { rows: 10 });
            module.exports = ChartEditor.getParams();
        "#;
        let result = FragmentRunner::run(&mut ctx, input("JavaScript", code)).await.unwrap();
        assert_eq!(result.exports, json!({ "region": ["eu"] }));
        assert_eq!(
            Value::Object(result.side_effects.params.unwrap()),
            json!({ "region": ["us"], "page": 2 })
        );
        assert_eq!(
            Value::Object(result.side_effects.data_sources_infos.unwrap()),
            json!({ "sales": { "rows": 10 } })
        );
    }

    #[tokio::test]
    async fn host_object_is_hidden_from_fragments() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(&mut ctx, input("UI", "module.exports = typeof host;"))
            .await
            .unwrap();
        assert_eq!(result.exports, json!("undefined"));
    }

    #[tokio::test]
    async fn console_lines_are_returned() {
        let mut ctx = context().await;
        let result = FragmentRunner::run(&mut ctx, input("Urls", "console.log('building urls');"))
            .await
            .unwrap();
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].message, "building urls");
    }

    #[tokio::test]
    async fn thrown_errors_propagate() {
        let mut ctx = context().await;
        let err = FragmentRunner::run(&mut ctx, input("Config", "throw new Error('no config');"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::JsError { ref message, .. } if message == "no config"));
    }
}
