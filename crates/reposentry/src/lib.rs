//! RepoSentry: a polling engine that watches Git repositories for
//! branch-level commit changes and delivers CloudEvents to a Tekton
//! trigger endpoint.
//!
//! The crate is structured around the flow of one change:
//!
//! * [`scheduler`] wakes enabled repositories on a cadence and fans them
//!   out over a bounded worker pool;
//! * [`engine`] lists branches through a [`provider`] client (rate-limited
//!   by [`ratelimit`], classified by [`repourl`]), diffs them against the
//!   [`ledger`], and asks the [`detector`] about in-tree pipeline
//!   definitions;
//! * [`dispatch`] turns each change into a CloudEvents envelope and POSTs
//!   it with bounded retries, committing the delivery and the branch-state
//!   advance in one ledger transaction;
//! * [`supervisor`] owns lifecycle, health, and reload.
//!
//! External collaborators (CLI, config loader, introspection API) consume
//! [`Config`], [`Supervisor`], and the ledger's read surface; nothing in
//! here parses flags or serves HTTP.

pub mod clock;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod engine;
pub mod ledger;
pub mod logging;
pub mod provider;
pub mod ratelimit;
pub mod repourl;
pub mod scheduler;
pub mod status;
pub mod supervisor;

pub use config::Config;
pub use supervisor::Supervisor;

/// The crate version, stamped into event payloads.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The User-Agent sent on every outbound request.
pub const USER_AGENT: &str = concat!("reposentry/", env!("CARGO_PKG_VERSION"));
