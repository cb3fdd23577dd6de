//! Background refresh of the metadata caches.
//!
//! Refresh jobs run on a tokio task, one at a time across processes (enforced
//! by the update lock), and call the metadata backend through a
//! [`BoundedCallExecutor`] so a hung backend cannot wedge them forever.

mod executor;
mod job;
mod monitor;
mod scheduler;
mod task;
mod trigger;

pub use executor::BoundedCallExecutor;
pub use job::{JobHandle, JobState, RefreshContext, RefreshJob, RefreshOutcome, RefreshTarget, WaitGuard};
pub use monitor::{MonitorConfig, MonitorReport, StaleLockMonitor};
pub use scheduler::{next_fire_time, ScheduleConfig, Scheduler};
pub use task::{schedule_after, TaskHandle};
pub use trigger::UpdateTrigger;
