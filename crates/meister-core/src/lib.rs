#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! State-store models and access layer for the meister scheduler.

pub mod models;
pub mod store;

pub use models::{ChallengeBinaryNode, Crash, CrashKind, Job, JobKind, RawRoundPoll};
pub use store::{DbConfig, JobInit, Store, StoreError};
