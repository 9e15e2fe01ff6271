//! Row types for the shared competition state store.
//!
//! The scheduler consumes these tables, it does not own them: workers and
//! the round ingestor write most of the columns. Only `jobs.priority` is
//! ever written back from here.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Discriminator selecting which creator emits a job and which worker
/// binary executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Crash-to-exploit jobs consumed by the rex worker.
    Rex,
    /// Raw-round-poll sanitization jobs.
    PollSanitizer,
}

impl JobKind {
    /// The worker tag stored on job rows of this kind.
    pub fn worker(self) -> &'static str {
        match self {
            JobKind::Rex => "rex",
            JobKind::PollSanitizer => "poll_sanitizer",
        }
    }
}

/// A unit of pending work, as persisted in the `jobs` table.
///
/// The payload is opaque to the scheduler; only the worker selected by
/// [`Job::worker`] interprets it. Resource hints are optional, the
/// schema defaults below apply when unset. Memory hints are MiB.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub worker: String,
    pub payload: Value,
    pub priority: i64,
    pub request_cpu: Option<f64>,
    pub request_memory: Option<i64>,
    pub limit_cpu: Option<f64>,
    pub limit_memory: Option<i64>,
    pub kvm_access: bool,
    pub data_access: bool,
    pub restart: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Schema default for `request_cpu`, in cores.
    pub const DEFAULT_REQUEST_CPU: f64 = 0.5;
    /// Schema default for `request_memory`, in MiB.
    pub const DEFAULT_REQUEST_MEMORY: i64 = 1024;
    /// Schema default for `limit_cpu`, in cores.
    pub const DEFAULT_LIMIT_CPU: f64 = 1.0;
    /// Schema default for `limit_memory`, in MiB.
    pub const DEFAULT_LIMIT_MEMORY: i64 = 2048;
}

/// A challenge binary with crashes attached by the fuzzing pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChallengeBinaryNode {
    pub id: i64,
    pub name: String,
}

/// A crash discovered against a challenge binary.
///
/// `kind` is free-form in the store; [`CrashKind::parse`] maps it onto
/// the vulnerability taxonomy the exploit pipeline understands.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Crash {
    pub id: i64,
    pub cbn_id: i64,
    pub kind: String,
}

/// A raw network poll captured for the current round.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawRoundPoll {
    pub id: i64,
    pub sanitized: bool,
}

/// Vulnerability classification attached to a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashKind {
    IpOverwrite,
    PartialIpOverwrite,
    UncontrolledIpOverwrite,
    BpOverwrite,
    PartialBpOverwrite,
    WriteWhatWhere,
    WriteXWhere,
    /// A write where the destination address is uncontrolled.
    UncontrolledWrite,
    ArbitraryRead,
    NullDereference,
    Unknown,
}

impl CrashKind {
    /// Parse the store's string representation. Returns `None` for kinds
    /// outside the taxonomy; callers treat that as a bug in the producer.
    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "ip_overwrite" => CrashKind::IpOverwrite,
            "partial_ip_overwrite" => CrashKind::PartialIpOverwrite,
            "uncontrolled_ip_overwrite" => CrashKind::UncontrolledIpOverwrite,
            "bp_overwrite" => CrashKind::BpOverwrite,
            "partial_bp_overwrite" => CrashKind::PartialBpOverwrite,
            "write_what_where" => CrashKind::WriteWhatWhere,
            "write_x_where" => CrashKind::WriteXWhere,
            "uncontrolled_write" => CrashKind::UncontrolledWrite,
            "arbitrary_read" => CrashKind::ArbitraryRead,
            "null_dereference" => CrashKind::NullDereference,
            "unknown" => CrashKind::Unknown,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::CrashKind;

    #[test]
    fn crash_kind_parses_the_full_taxonomy() {
        assert_eq!(CrashKind::parse("ip_overwrite"), Some(CrashKind::IpOverwrite));
        assert_eq!(CrashKind::parse("write_x_where"), Some(CrashKind::WriteXWhere));
        assert_eq!(CrashKind::parse("unknown"), Some(CrashKind::Unknown));
        assert_eq!(CrashKind::parse("heap_spray"), None);
        assert_eq!(CrashKind::parse(""), None);
    }
}
