//! Collection scheduling, reconciliation and the concrete coin routines.

pub mod config;
pub mod normalize;
pub mod reconcile;
pub mod retry;
pub mod routine;
pub mod routines;
pub mod scheduler;
pub mod sink;

pub use config::{CollectorConfig, RoutineOverride, RoutineRegistry};
pub use normalize::{coerce, project, subdivide, Normalization, ShapeMap};
pub use reconcile::{index_by_key, new_keys, ExistingIndex, ReconcilePlan, ReconciliationEngine};
pub use retry::RetryPolicy;
pub use routine::{DuePolicy, Routine, RoutineError, RoutineWork, RunReport, WorkOutcome};
pub use routines::{build_routines, routine_by_name, ServiceContext, ROUTINES};
pub use scheduler::{CycleSummary, Scheduler, SchedulerHandle};
pub use sink::{OutcomeSink, RecordingSink, Reported, TracingSink, Warning};

pub const CRATE_NAME: &str = "coinwatch-sync";
