//! Job Reaper keeps leftover Kubernetes Jobs from piling up. It periodically lists Jobs, picks
//! out the ones whose names start with a configured prefix, and sets
//! `spec.ttlSecondsAfterFinished` on them so that the cluster's own TTL controller garbage
//! collects them (and their pods) once they finish. It never deletes anything itself.
//!
//! There are two ways of running it:
//!
//! - continuously, with `run_reaper`, which enforces a long ttl (10 minutes by default) every
//!   `interval` until the process is told to stop
//! - once, with `run_cleanup_now`, which sets a very short ttl (1 second by default) on every
//!   matching job right away
//!
//! ```no_run
//! use job_reaper::prelude::*;
//! use std::time::Duration;
//!
//! let config = ReaperConfig::new("scan-reaper", "scan-job-")
//!     .with_ttl_seconds(600)
//!     .with_interval(Duration::from_secs(300));
//!
//! // blocks until SIGINT or SIGTERM
//! if let Err(err) = run_reaper(config) {
//!     eprintln!("reaper failed to start: {}", err);
//! }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod error;
pub mod filter;
pub mod k8s_types;
pub mod resource;
pub mod runner;

pub use serde_json;

pub mod prelude {
    pub use crate::config::{ClientConfig, ReaperConfig};
    pub use crate::error::Error;
    pub use crate::filter::JobFilter;
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::resource::ManagedObject;
    pub use crate::runner::{run_cleanup_now, run_reaper, CycleReport, ReaperHandle};
}
