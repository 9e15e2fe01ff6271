//! Prioritization strategies.

use std::cmp::Ordering;

use meister_core::Job;

/// One job and the priority the brain assigned it. Lives for one tick.
pub(crate) type Candidate = (Job, f64);

/// A strategy totally ordering a batch of candidate jobs.
///
/// Implementations must not mutate the jobs they are handed. Ties are
/// broken at the brain's discretion, deterministically within a tick;
/// callers must not rely on anything stronger.
pub(crate) trait Brain: Send + Sync {
    /// Order `jobs` by non-increasing priority.
    fn sort(&self, jobs: Vec<Job>) -> Vec<Candidate>;
}

/// The default brain: a stable sort on the job's stored priority.
#[derive(Debug, Default)]
pub(crate) struct ToadBrain;

impl ToadBrain {
    fn score(job: &Job) -> f64 {
        job.priority as f64
    }
}

impl Brain for ToadBrain {
    fn sort(&self, jobs: Vec<Job>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = jobs
            .into_iter()
            .map(|job| {
                let score = Self::score(&job);
                (job, score)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::{Brain, ToadBrain};
    use crate::testutil::job_with_priority;

    #[test]
    fn output_is_non_increasing_in_priority() {
        let jobs = vec![
            job_with_priority(1, 10),
            job_with_priority(2, 100),
            job_with_priority(3, 50),
            job_with_priority(4, 100),
        ];
        let sorted = ToadBrain.sort(jobs);
        let priorities: Vec<f64> = sorted.iter().map(|(_, p)| *p).collect();
        assert_eq!(priorities, vec![100.0, 100.0, 50.0, 10.0]);
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn ties_keep_input_order_and_jobs_are_untouched() {
        let jobs = vec![
            job_with_priority(7, 80),
            job_with_priority(8, 80),
            job_with_priority(9, 80),
        ];
        let sorted = ToadBrain.sort(jobs.clone());
        let ids: Vec<i64> = sorted.iter().map(|(job, _)| job.id).collect();
        assert_eq!(ids, vec![7, 8, 9]);
        for ((job, _), original) in sorted.iter().zip(&jobs) {
            assert_eq!(job, original);
        }
    }
}
