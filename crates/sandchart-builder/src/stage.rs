//! Build stages, their source fields and deadlines.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use sandchart_config::TimeoutOverrides;

use crate::ChartConfig;

/// Default deadline for every stage except the chart JavaScript.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default deadline for the chart JavaScript stage.
pub const DEFAULT_JS_TIMEOUT: Duration = Duration::from_millis(9500);

/// Source used when a chart has no `js` fragment.
pub const EMPTY_JS_MODULE: &str = "module.exports = {};";

/// The chart library a library-config fragment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Library {
    /// `graph` fragment of a time-series chart.
    Yagr,
    /// `graph` fragment of any other chart.
    Highcharts,
    /// `map` fragment.
    Highmaps,
    /// `ymap` fragment.
    YandexMaps,
}

impl Library {
    /// Diagnostic label used as the stage name.
    pub fn label(self) -> &'static str {
        match self {
            Self::Yagr => "Yagr",
            Self::Highcharts => "Highcharts",
            Self::Highmaps => "Highmaps",
            Self::YandexMaps => "Yandex.Maps",
        }
    }

    /// The chart field this library's config is read from.
    pub fn field(self) -> &'static str {
        match self {
            Self::Yagr | Self::Highcharts => "graph",
            Self::Highmaps => "map",
            Self::YandexMaps => "ymap",
        }
    }
}

/// Pick the library-config fragment: `graph`, else `map`, else `ymap`.
///
/// Returns `None` when the chart has none of them.
pub fn select_library(config: &ChartConfig) -> Option<(Library, &str)> {
    if let Some(code) = config.fragment("graph") {
        let library = if config.stype().starts_with("timeseries") {
            Library::Yagr
        } else {
            Library::Highcharts
        };
        return Some((library, code));
    }
    if let Some(code) = config.fragment("map") {
        return Some((Library::Highmaps, code));
    }
    config
        .fragment("ymap")
        .map(|code| (Library::YandexMaps, code))
}

/// One step of a chart build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Request parameter normalization (`params`).
    Params,
    /// Data source URLs (`url`).
    Urls,
    /// Chart-library config (`graph` / `map` / `ymap`).
    LibraryConfig(Library),
    /// Chart-type config tab.
    Config,
    /// Chart JavaScript (`js`).
    JavaScript,
    /// Interactive controls (`ui`).
    Ui,
}

impl Stage {
    /// Stage label as reported in results and errors.
    pub fn label(self) -> &'static str {
        match self {
            Self::Params => "Params",
            Self::Urls => "Urls",
            Self::LibraryConfig(library) => library.label(),
            Self::Config => "Config",
            Self::JavaScript => "JavaScript",
            Self::Ui => "UI",
        }
    }

    /// Whether the stage sees loaded data.
    pub fn receives_data(self) -> bool {
        !matches!(self, Self::Params | Self::Urls)
    }

    /// Whether the stage sees data-source statistics.
    pub fn receives_data_stats(self) -> bool {
        matches!(self, Self::JavaScript)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-stage deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Params stage.
    pub params: Duration,
    /// Urls stage.
    pub urls: Duration,
    /// Library-config stage.
    pub library_config: Duration,
    /// Config stage.
    pub config: Duration,
    /// JavaScript stage.
    pub javascript: Duration,
    /// UI stage.
    pub ui: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            params: DEFAULT_STAGE_TIMEOUT,
            urls: DEFAULT_STAGE_TIMEOUT,
            library_config: DEFAULT_STAGE_TIMEOUT,
            config: DEFAULT_STAGE_TIMEOUT,
            javascript: DEFAULT_JS_TIMEOUT,
            ui: DEFAULT_STAGE_TIMEOUT,
        }
    }
}

impl StageTimeouts {
    /// Defaults with any configured overrides applied.
    pub fn from_overrides(overrides: &TimeoutOverrides) -> Self {
        let d = Self::default();
        let pick = |ms: Option<u64>, default: Duration| ms.map(Duration::from_millis).unwrap_or(default);
        Self {
            params: pick(overrides.params_ms, d.params),
            urls: pick(overrides.urls_ms, d.urls),
            library_config: pick(overrides.library_config_ms, d.library_config),
            config: pick(overrides.config_ms, d.config),
            javascript: pick(overrides.javascript_ms, d.javascript),
            ui: pick(overrides.ui_ms, d.ui),
        }
    }

    /// Deadline for `stage`.
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Params => self.params,
            Stage::Urls => self.urls,
            Stage::LibraryConfig(_) => self.library_config,
            Stage::Config => self.config,
            Stage::JavaScript => self.javascript,
            Stage::Ui => self.ui,
        }
    }
}

/// Chart type → config-tab field table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTabs(HashMap<String, String>);

const DEFAULT_CONFIG_TABS: &[(&str, &str)] = &[
    ("graph_node", "statface_graph"),
    ("map_node", "statface_map"),
    ("ymap_node", "statface_map"),
    ("metric_node", "statface_metric"),
    ("text_node", "statface_text"),
    ("table_node", "table"),
];

impl Default for ConfigTabs {
    fn default() -> Self {
        Self(
            DEFAULT_CONFIG_TABS
                .iter()
                .map(|(stype, field)| (stype.to_string(), field.to_string()))
                .collect(),
        )
    }
}

impl ConfigTabs {
    /// Built-in table with `extra` entries merged over it.
    pub fn with_overrides(extra: &HashMap<String, String>) -> Self {
        let mut tabs = Self::default();
        tabs.0.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        tabs
    }

    /// Field holding the config tab of `stype`, if the type has one.
    pub fn field_for(&self, stype: &str) -> Option<&str> {
        self.0.get(stype).map(String::as_str)
    }

    /// Source of the config tab of `config`; empty when unmapped or absent.
    pub fn source<'a>(&self, config: &'a ChartConfig) -> &'a str {
        self.field_for(config.stype())
            .and_then(|field| config.fragment(field))
            .unwrap_or("")
    }
}
