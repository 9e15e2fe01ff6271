//! Job creators: one per job kind, each reading the state store and
//! deciding what work is pending.

pub(crate) mod poll_sanitizer;
pub(crate) mod rex;

use async_trait::async_trait;

use meister_core::Job;

/// A producer of pending jobs for one job kind.
///
/// Called once per tick, concurrently with the other creators; the
/// output may be empty and must be finite. A failing creator truncates
/// only its own contribution; the call site catches the error.
#[async_trait]
pub(crate) trait Creator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn jobs(&self) -> anyhow::Result<Vec<Job>>;
}
