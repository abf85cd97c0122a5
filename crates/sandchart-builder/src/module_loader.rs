//! Loads resolved dependency modules into a session context.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use sandchart_sandbox::{ExecutionContext, LogLine, RunKind, RunRequest, SandboxError};

use crate::ResolvedModule;

/// Identity values modules see as globals.
#[derive(Debug, Clone, Default)]
pub struct ModuleGlobals {
    /// Requesting user.
    pub user_login: Option<String>,
    /// Requesting user's language.
    pub user_lang: Option<String>,
    /// Whether the request comes from the screenshot renderer.
    pub is_screenshoter: bool,
}

/// A module now present in the context's registry.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedModule {
    /// Registry name.
    pub name: String,
    /// Top-level keys of `module.exports`, when it is an object.
    pub exported: Vec<String>,
    /// Captured console output.
    pub logs: Vec<LogLine>,
    /// Wall-clock load time in milliseconds.
    pub runtime_ms: u64,
}

/// Evaluates module sources into a context's module registry.
pub struct ModuleLoader;

impl ModuleLoader {
    /// Evaluate `module` and register its exports under its name.
    ///
    /// Later modules and fragments reach it with `require(name)`.
    pub async fn load(
        context: &mut ExecutionContext,
        module: &ResolvedModule,
        globals: &ModuleGlobals,
        timeout: Duration,
    ) -> Result<LoadedModule, SandboxError> {
        let request = RunRequest::new(module.name.clone(), module_body(&module.source))
            .source(module.source.as_str())
            .kind(RunKind::Module)
            .timeout(timeout)
            .global("moduleName", Value::String(module.name.clone()))
            .global(
                "userLogin",
                globals.user_login.clone().map_or(Value::Null, Value::String),
            )
            .global(
                "userLang",
                globals.user_lang.clone().map_or(Value::Null, Value::String),
            )
            .global("isScreenshoter", Value::Bool(globals.is_screenshoter));

        let output = context.run(request).await?;
        let exported = serde_json::from_value(output.value)?;

        Ok(LoadedModule {
            name: module.name.clone(),
            exported,
            logs: output.logs,
            runtime_ms: output.duration.as_millis() as u64,
        })
    }
}

fn module_body(code: &str) -> String {
    format!(
        r#"const module = {{ exports: {{}} }};
const exports = module.exports;
const require = host.require;
await (async function (module, exports, require, host) {{
{code}
}})(module, exports, require, undefined);
let __exports = module.exports;
if (__exports && typeof __exports.then === 'function') {{
    __exports = await __exports;
}}
host.register(moduleName, __exports);
return __exports !== null && typeof __exports === 'object' ? Object.keys(__exports) : [];
"#
    )
}
