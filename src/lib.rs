//! stencil: a template-to-bytecode compiler with a dependency-aware
//! memoization cache and an incremental recompilation scheduler.
//!
//! The [`Engine`] owns every piece of state: the compiler, the cache actor,
//! the dependency graph, the tiering compiler and the scheduler. Subsystems
//! are usable on their own as well; see the module docs.

pub mod cache;
pub mod cancel;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hash;
pub mod incremental;
pub mod telemetry;
pub mod types;
pub mod value;
pub mod vm;

/// Version of the bytecode and blob formats. Suffixed to every cache key,
/// so bumping it orphans all previously cached artifacts.
pub const FORMAT_VERSION: u32 = 1;

pub use compiler::{build, CompiledTemplate, TemplateCompiler, TemplateMetadata};
pub use config::{CacheConfig, CompilerConfig, EngineConfig, SchedulerConfig};
pub use engine::Engine;
pub use error::{
    CacheIoError, CompileError, ConfigError, CycleError, ParseError, RenderError, SchedulingError,
    StencilError,
};
pub use events::EngineEvent;
pub use hash::{content_hash, CacheKey, ContentHash};
pub use incremental::{ChangeKind, ChangeRecord, ImpactLevel, Priority};
pub use types::OptimizationLevel;
pub use value::{RenderContext, Value};
