//! Dependency resolution: which modules a chart needs, in load order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::{ChartConfig, ResolveError};

/// Default maximum `require` nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 16;

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\(\s*['"]([^'"\s]+)['"]\s*\)"#).expect("valid regex")
});

/// A module to load into a build session. Order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    /// Name fragments `require` it by.
    pub name: String,
    /// CommonJS source.
    pub source: String,
}

impl ResolvedModule {
    /// Create a resolved module.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Request-scoped context for resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Workbook the chart belongs to, for stores that scope modules by workbook.
    pub workbook_id: Option<String>,
    /// Headers to forward when a store fetches modules remotely.
    pub headers: BTreeMap<String, String>,
}

/// Produces the ordered module list for a chart.
#[async_trait::async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Resolve every module `config` depends on, dependencies first.
    async fn resolve(
        &self,
        config: &ChartConfig,
        request: &ResolveRequest,
    ) -> Result<Vec<ResolvedModule>, ResolveError>;
}

/// Returns a fixed module list regardless of the chart.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    modules: Vec<ResolvedModule>,
}

impl StaticResolver {
    /// Resolve to `modules`, in the given order.
    pub fn new(modules: Vec<ResolvedModule>) -> Self {
        Self { modules }
    }

    /// Resolve to nothing.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DependencyResolver for StaticResolver {
    async fn resolve(
        &self,
        _config: &ChartConfig,
        _request: &ResolveRequest,
    ) -> Result<Vec<ResolvedModule>, ResolveError> {
        Ok(self.modules.clone())
    }
}

/// Source of module code by name.
#[async_trait::async_trait]
pub trait ModuleStore: Send + Sync {
    /// Fetch the source of `name`, or `None` if the store has no such module.
    async fn fetch(
        &self,
        name: &str,
        request: &ResolveRequest,
    ) -> Result<Option<String>, ResolveError>;
}

/// Serves `<root>/<name>.js`.
///
/// Names may contain `/` to reach nested directories but never `..` or an
/// absolute path.
#[derive(Debug, Clone)]
pub struct DirectoryModuleStore {
    root: PathBuf,
}

impl DirectoryModuleStore {
    /// Serve modules from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ResolveError> {
        let valid = !name.is_empty()
            && !name.starts_with('/')
            && name
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
        if !valid {
            return Err(ResolveError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(format!("{name}.js")))
    }
}

#[async_trait::async_trait]
impl ModuleStore for DirectoryModuleStore {
    async fn fetch(
        &self,
        name: &str,
        _request: &ResolveRequest,
    ) -> Result<Option<String>, ResolveError> {
        let path = self.path_for(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ResolveError::Store {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// In-memory module store.
#[derive(Debug, Clone, Default)]
pub struct MemoryModuleStore {
    modules: HashMap<String, String>,
}

impl MemoryModuleStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module.
    pub fn with_module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.insert(name.into(), source.into());
        self
    }
}

#[async_trait::async_trait]
impl ModuleStore for MemoryModuleStore {
    async fn fetch(
        &self,
        name: &str,
        _request: &ResolveRequest,
    ) -> Result<Option<String>, ResolveError> {
        Ok(self.modules.get(name).cloned())
    }
}

/// Names passed to `require('…')` in `source`, in order of appearance.
pub fn scan_requires(source: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    REQUIRE_RE
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Follows `require('…')` calls from the chart's fragments through a
/// [`ModuleStore`].
///
/// Modules are returned dependencies first. Native module names are left to
/// the host and never fetched.
pub struct RequireGraphResolver {
    store: Arc<dyn ModuleStore>,
    natives: HashSet<String>,
    max_depth: usize,
}

impl RequireGraphResolver {
    /// Resolve through `store`.
    pub fn new(store: Arc<dyn ModuleStore>) -> Self {
        Self {
            store,
            natives: HashSet::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Names served by the host that must not be fetched.
    pub fn with_natives<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.natives.extend(names.into_iter().map(Into::into));
        self
    }

    /// Override the maximum `require` nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fetch every reachable module and its direct requires.
    async fn fetch_graph(
        &self,
        roots: &[(String, String)],
        request: &ResolveRequest,
    ) -> Result<HashMap<String, (String, Vec<String>)>, ResolveError> {
        let mut graph = HashMap::new();
        let mut queue: VecDeque<(String, String)> = roots.iter().cloned().collect();

        while let Some((name, required_by)) = queue.pop_front() {
            if graph.contains_key(&name) || self.natives.contains(&name) {
                continue;
            }
            let source = self
                .store
                .fetch(&name, request)
                .await?
                .ok_or_else(|| ResolveError::NotFound {
                    name: name.clone(),
                    required_by,
                })?;
            let requires = scan_requires(&source);
            for dep in &requires {
                queue.push_back((dep.clone(), name.clone()));
            }
            tracing::debug!(module = %name, requires = requires.len(), "module fetched");
            graph.insert(name, (source, requires));
        }
        Ok(graph)
    }

    fn visit(
        &self,
        name: &str,
        graph: &mut HashMap<String, (String, Vec<String>)>,
        path: &mut Vec<String>,
        out: &mut Vec<ResolvedModule>,
    ) -> Result<(), ResolveError> {
        if self.natives.contains(name) || out.iter().any(|m| m.name == name) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut chain = path[pos..].to_vec();
            chain.push(name.to_string());
            return Err(ResolveError::Cycle { chain });
        }
        if path.len() >= self.max_depth {
            return Err(ResolveError::TooDeep {
                name: name.to_string(),
                max_depth: self.max_depth,
            });
        }

        let requires = match graph.get(name) {
            Some((_, requires)) => requires.clone(),
            None => return Ok(()),
        };
        path.push(name.to_string());
        for dep in &requires {
            self.visit(dep, graph, path, out)?;
        }
        path.pop();

        if let Some((source, _)) = graph.remove(name) {
            out.push(ResolvedModule::new(name, source));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DependencyResolver for RequireGraphResolver {
    async fn resolve(
        &self,
        config: &ChartConfig,
        request: &ResolveRequest,
    ) -> Result<Vec<ResolvedModule>, ResolveError> {
        let mut roots = Vec::new();
        for (field, code) in config.code_fragments() {
            for name in scan_requires(code) {
                if !roots.iter().any(|(n, _)| n == &name) {
                    roots.push((name, field.to_string()));
                }
            }
        }
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let mut graph = self.fetch_graph(&roots, request).await?;
        let mut out = Vec::new();
        let mut path = Vec::new();
        for (name, _) in &roots {
            self.visit(name, &mut graph, &mut path, &mut out)?;
        }

        tracing::debug!(
            chart = %config.key,
            modules = out.len(),
            "dependencies resolved"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartMeta;

    fn chart(js: &str) -> ChartConfig {
        ChartConfig {
            key: "k".into(),
            data: [("js".to_string(), js.to_string())].into_iter().collect(),
            meta: ChartMeta::default(),
        }
    }

    fn names(modules: &[ResolvedModule]) -> Vec<&str> {
        modules.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn scans_both_quote_styles() {
        let src = r#"const a = require('lib/a'); const b = require( "b" ); require('lib/a');"#;
        assert_eq!(scan_requires(src), vec!["lib/a", "b"]);
    }

    #[test]
    fn ignores_non_literal_requires() {
        assert!(scan_requires("require(name); prerequire('x')").is_empty());
    }

    #[tokio::test]
    async fn static_resolver_returns_fixed_list() {
        let resolver = StaticResolver::new(vec![
            ResolvedModule::new("a", "1"),
            ResolvedModule::new("b", "2"),
        ]);
        let modules = resolver
            .resolve(&ChartConfig::default(), &ResolveRequest::default())
            .await
            .unwrap();
        assert_eq!(names(&modules), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn dependencies_come_first() {
        let store = MemoryModuleStore::new()
            .with_module("app", "require('utils'); require('format');")
            .with_module("format", "require('utils');")
            .with_module("utils", "module.exports = {};");
        let resolver = RequireGraphResolver::new(Arc::new(store));
        let modules = resolver
            .resolve(&chart("const app = require('app');"), &ResolveRequest::default())
            .await
            .unwrap();
        assert_eq!(names(&modules), vec!["utils", "format", "app"]);
    }

    #[tokio::test]
    async fn natives_are_not_fetched() {
        let store = MemoryModuleStore::new().with_module("app", "require('lodash');");
        let resolver = RequireGraphResolver::new(Arc::new(store)).with_natives(["lodash"]);
        let modules = resolver
            .resolve(&chart("require('app'); require('lodash');"), &ResolveRequest::default())
            .await
            .unwrap();
        assert_eq!(names(&modules), vec!["app"]);
    }

    #[tokio::test]
    async fn missing_module_names_requirer() {
        let store = MemoryModuleStore::new().with_module("app", "require('gone');");
        let resolver = RequireGraphResolver::new(Arc::new(store));
        let err = resolver
            .resolve(&chart("require('app');"), &ResolveRequest::default())
            .await
            .unwrap_err();
        match err {
            ResolveError::NotFound { name, required_by } => {
                assert_eq!(name, "gone");
                assert_eq!(required_by, "app");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let store = MemoryModuleStore::new()
            .with_module("a", "require('b');")
            .with_module("b", "require('a');");
        let resolver = RequireGraphResolver::new(Arc::new(store));
        let err = resolver
            .resolve(&chart("require('a');"), &ResolveRequest::default())
            .await
            .unwrap_err();
        match err {
            ResolveError::Cycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn depth_is_bounded() {
        let store = MemoryModuleStore::new()
            .with_module("m0", "require('m1');")
            .with_module("m1", "require('m2');")
            .with_module("m2", "require('m3');")
            .with_module("m3", "");
        let resolver = RequireGraphResolver::new(Arc::new(store)).with_max_depth(2);
        let err = resolver
            .resolve(&chart("require('m0');"), &ResolveRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::TooDeep { max_depth: 2, .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn chart_without_requires_resolves_to_nothing() {
        let resolver = RequireGraphResolver::new(Arc::new(MemoryModuleStore::new()));
        let modules = resolver
            .resolve(&chart("module.exports = {};"), &ResolveRequest::default())
            .await
            .unwrap();
        assert!(modules.is_empty());
    }

    #[tokio::test]
    async fn directory_store_reads_js_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/util.js"), "module.exports = 1;").unwrap();

        let store = DirectoryModuleStore::new(dir.path());
        let req = ResolveRequest::default();
        assert_eq!(
            store.fetch("lib/util", &req).await.unwrap().as_deref(),
            Some("module.exports = 1;")
        );
        assert_eq!(store.fetch("lib/missing", &req).await.unwrap(), None);
    }

    #[tokio::test]
    async fn directory_store_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryModuleStore::new(dir.path());
        let req = ResolveRequest::default();
        for name in ["../secret", "/etc/passwd", "a//b", "", "a b"] {
            let err = store.fetch(name, &req).await.unwrap_err();
            assert!(matches!(err, ResolveError::InvalidName { .. }), "{name}: {err:?}");
        }
    }
}
