//! Razeedash maintenance jobs.
//!
//! Two binaries share this library: `rotate-org-keys` moves encrypted
//! resources onto a fresh organization key, and `migrate-org-keys` converts
//! legacy key strings into key records. Both run to completion and exit; they
//! are meant to be scheduled as Kubernetes `CronJob`s.

pub mod config;
pub mod error;
pub mod migration;
pub mod records;
pub mod rotation;
pub mod state;
pub mod telemetry;
