pub mod decision;
pub mod dispatcher;
pub mod field_change;
pub mod handler;
pub mod invocation_monitor;
pub mod ledger_retention;
pub mod safe_exec;
pub mod self_update;
pub mod tagger;
mod task;

pub use task::TaskHandle;
