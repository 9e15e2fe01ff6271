//! Creator for crash-exploitation jobs.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use meister_core::{CrashKind, Job, JobInit, JobKind, Store};

use super::Creator;

const LIMIT_CPU: f64 = 1.0;
// Exploitation occasionally needs a lot of headroom; 10 GiB covers the
// worst crashes seen so far.
const LIMIT_MEMORY: i64 = 10 * 1024;

/// Crash kinds not worth handing to the exploitation pipeline.
const FILTERED_KINDS: [CrashKind; 4] = [
    CrashKind::NullDereference,
    CrashKind::UncontrolledIpOverwrite,
    CrashKind::UncontrolledWrite,
    CrashKind::Unknown,
];

/// Dispatch priority per crash kind. The filtered kinds keep a zero
/// entry as a safety net in case the filter above ever drifts.
fn priority_for(kind: CrashKind) -> Option<i64> {
    Some(match kind {
        CrashKind::IpOverwrite => 100,
        CrashKind::PartialIpOverwrite => 80,
        CrashKind::ArbitraryRead => 75,
        CrashKind::WriteWhatWhere => 50,
        CrashKind::WriteXWhere => 25,
        CrashKind::BpOverwrite => 10, // doesn't appear to be exploitable
        CrashKind::PartialBpOverwrite => 5,
        CrashKind::UncontrolledWrite => 0,
        CrashKind::UncontrolledIpOverwrite => 0,
        CrashKind::NullDereference => 0,
        CrashKind::Unknown => return None,
    })
}

pub(crate) enum CrashVerdict {
    Emit(i64),
    Filtered,
    /// The kind has no priority entry; producing one is a bug upstream.
    Bug,
}

pub(crate) fn assess_crash(kind: &str) -> CrashVerdict {
    let Some(kind) = CrashKind::parse(kind) else {
        return CrashVerdict::Bug;
    };
    if FILTERED_KINDS.contains(&kind) {
        return CrashVerdict::Filtered;
    }
    match priority_for(kind) {
        Some(priority) => CrashVerdict::Emit(priority),
        None => CrashVerdict::Bug,
    }
}

/// Emits one exploitation job per exploitable crash on every known
/// challenge binary.
pub(crate) struct RexCreator {
    store: Store,
}

impl RexCreator {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Creator for RexCreator {
    fn name(&self) -> &'static str {
        "rex"
    }

    async fn jobs(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for cbn in self.store.challenge_binaries().await? {
            for crash in self.store.crashes_for(cbn.id).await? {
                let priority = match assess_crash(&crash.kind) {
                    CrashVerdict::Emit(priority) => priority,
                    CrashVerdict::Filtered => continue,
                    CrashVerdict::Bug => {
                        error!(
                            crash = crash.id,
                            kind = %crash.kind,
                            "no priority for crash kind, this is a bug"
                        );
                        continue;
                    }
                };

                let init = JobInit {
                    limit_cpu: Some(LIMIT_CPU),
                    limit_memory: Some(LIMIT_MEMORY),
                    ..JobInit::new(
                        JobKind::Rex,
                        json!({ "cbn_id": cbn.id, "crash_id": crash.id }),
                    )
                };
                let mut job = self.store.get_or_create_job(init).await?;
                job.priority = priority;
                debug!(
                    cbn = cbn.id,
                    crash = crash.id,
                    priority,
                    "yielding rex job"
                );
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::{CrashVerdict, assess_crash};

    fn emitted(kind: &str) -> Option<i64> {
        match assess_crash(kind) {
            CrashVerdict::Emit(priority) => Some(priority),
            _ => None,
        }
    }

    #[test]
    fn priorities_follow_the_vulnerability_table() {
        assert_eq!(emitted("ip_overwrite"), Some(100));
        assert_eq!(emitted("partial_ip_overwrite"), Some(80));
        assert_eq!(emitted("arbitrary_read"), Some(75));
        assert_eq!(emitted("write_what_where"), Some(50));
        assert_eq!(emitted("write_x_where"), Some(25));
        assert_eq!(emitted("bp_overwrite"), Some(10));
        assert_eq!(emitted("partial_bp_overwrite"), Some(5));
    }

    #[test]
    fn unexploitable_kinds_are_filtered() {
        for kind in [
            "null_dereference",
            "uncontrolled_ip_overwrite",
            "uncontrolled_write",
            "unknown",
        ] {
            assert!(matches!(assess_crash(kind), CrashVerdict::Filtered), "{kind}");
        }
    }

    #[test]
    fn kinds_outside_the_taxonomy_are_a_bug() {
        assert!(matches!(assess_crash("stack_pivot"), CrashVerdict::Bug));
        assert!(matches!(assess_crash(""), CrashVerdict::Bug));
    }

    #[test]
    fn a_crash_batch_maps_to_the_expected_priorities() {
        let crashes = ["ip_overwrite", "arbitrary_read", "null_dereference"];
        let priorities: Vec<i64> = crashes.iter().filter_map(|k| emitted(k)).collect();
        assert_eq!(priorities, vec![100, 75]);
    }
}
