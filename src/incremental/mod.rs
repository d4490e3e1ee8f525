//! Incremental recompilation: which templates a change touches, how urgent
//! it is, and the batch runner that recompiles them.

mod change;
mod graph;
mod scheduler;
mod state;

pub use change::{
    has_structural_markers, ChangeAnalyzer, ChangeImpact, ChangeKind, ChangeRecord, ImpactLevel,
    Priority,
};
pub use graph::DependencyGraph;
pub use scheduler::{
    BatchReport, Job, JobKind, JobOutcome, JobOutput, JobReport, JobRunner, Scheduler,
};
pub use state::{SchedulerState, SchedulerStats};
