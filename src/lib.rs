//! Web front end for a command-line media downloader.
//!
//! Requests are classified by platform, admitted by the rate limiter, turned
//! into a yt-dlp invocation, executed under a hard time budget, and the
//! resulting file is exposed for retrieval from a managed directory.

pub mod artifacts;
pub mod config;
pub mod download_spec;
pub mod error;
pub mod job;
pub mod platform;
pub mod probe;
pub mod rate_limit;
pub mod routes;
pub mod runner;

pub use artifacts::ArtifactStore;
pub use config::Config;
pub use routes::{AppState, cors_layer, router};
pub use runner::{CommandRunner, JobOutcome, ProcessRunner, RunnerError};
