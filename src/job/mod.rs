pub mod reconcile_job;

pub use reconcile_job::{build_reconcile_job, start_reconcile_scheduler};
