// snapshot2catalog-scheduler - Run lifecycle
//
// NotStarted -> Exporting -> Cataloging -> Done, with Failed reachable from
// Exporting and Cataloging. Triggers come from the daily cadence or from
// explicit invocation and always return a Run id before the Run completes.

pub mod cadence;
pub mod registry;
pub mod scheduler;

pub use cadence::Cadence;
pub use registry::RunRegistry;
pub use scheduler::{Pipeline, Scheduler, SchedulerSettings};
