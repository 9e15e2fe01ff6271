//! Creator for raw-round-poll sanitization bookkeeping.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use meister_core::{Job, JobInit, JobKind, Store};

use super::Creator;

/// Inserts one sanitizer job per unsanitized poll but yields nothing:
/// the sanitizer worker discovers its rows directly, so no pod is ever
/// scheduled from here.
pub(crate) struct PollSanitizerCreator {
    store: Store,
}

impl PollSanitizerCreator {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Creator for PollSanitizerCreator {
    fn name(&self) -> &'static str {
        "poll_sanitizer"
    }

    async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
        for poll in self.store.unsanitized_polls().await? {
            debug!(poll = poll.id, "creating poll sanitizer job");
            self.store
                .get_or_create_job(JobInit::new(
                    JobKind::PollSanitizer,
                    json!({ "rrp_id": poll.id }),
                ))
                .await?;
        }
        Ok(Vec::new())
    }
}
