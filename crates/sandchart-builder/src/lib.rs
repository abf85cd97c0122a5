#![warn(missing_docs)]

//! # sandchart-builder
//!
//! The multi-stage chart build pipeline.
//!
//! A [`ChartBuilder`] opens a [`BuildSession`] per chart build. The session
//! owns one isolated execution context and drives it through:
//!
//! 1. [`BuildSession::load_shared`]: install the chart's shared-state object
//! 2. [`BuildSession::load_modules`]: resolve dependency modules and load them
//!    in order
//! 3. the stages, conventionally params → urls → library config / config →
//!    chart JS → UI
//! 4. [`BuildSession::close`]: release the context
//!
//! Every stage sees the same shared object and module registry; a stage that
//! times out or throws fails on its own and leaves the session usable.

pub mod chart;
pub mod error;
pub mod fragment;
pub mod module_loader;
pub mod resolver;
pub mod session;
pub mod stage;

pub use chart::{ChartConfig, ChartMeta};
pub use error::{BuildError, ResolveError};
pub use fragment::{FragmentInput, FragmentResult, FragmentRunner, SideEffects};
pub use module_loader::{LoadedModule, ModuleGlobals, ModuleLoader};
pub use resolver::{
    DependencyResolver, DirectoryModuleStore, MemoryModuleStore, ModuleStore,
    RequireGraphResolver, ResolveRequest, ResolvedModule, StaticResolver,
};
pub use session::{
    sandbox_config, BuildLimits, BuildOptions, BuildSession, ChartBuilder, SessionOptions,
    StageResult,
};
pub use stage::{select_library, ConfigTabs, Library, Stage, StageTimeouts};
