//! # lms-dl
//!
//! Course-platform download library and CLI.
//!
//! lms-dl exposes a session-authenticated learning-management platform
//! as a browsable, lazily-populated virtual filesystem and materializes
//! selected subtrees onto local disk with retry and idempotence
//! guarantees.
//!
//! ## Design Philosophy
//!
//! - **Lazy everywhere** - Nothing is fetched until a path resolution
//!   first touches it; every node populates through exactly one fetch
//! - **Idempotent downloads** - Re-running a download against an
//!   unchanged remote skips everything it already wrote
//! - **Strictly sequential** - One session, one thread, blocking I/O;
//!   the platform's session state cannot be shared
//! - **Narrow transport boundary** - The tree only sees the
//!   [`DataSource`] trait; the HTTP client is one implementation of it
//!
//! ## Quick Start
//!
//! ```no_run
//! use lms_dl::{Config, Downloader, HttpDataSource, RetryPolicy, SilentReport, Vfs};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("default")?;
//!     let source =
//!         HttpDataSource::new(&config.endpoints, &config.api_cookies, &config.web_cookies)?;
//!     let vfs = Vfs::new(Rc::new(RefCell::new(source)), config.labels, config.edit)?;
//!
//!     let downloader = Downloader::new(&vfs, RetryPolicy::from_retry_count(3));
//!     let ok = downloader.run("/courses/current", &mut SilentReport);
//!     std::process::exit(if ok { 0 } else { 1 });
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types and profile persistence
pub mod config;
/// The network/session boundary and its HTTP implementation
pub mod datasource;
/// Download orchestrator
pub mod download;
/// Error types
pub mod error;
/// Credential acquisition through login helpers
pub mod helper;
/// Human-facing listing
pub mod listing;
/// Retry logic with exponential backoff
pub mod retry;
/// The virtual filesystem
pub mod vfs;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{Config, CourseAddition, EditPlan, Endpoints, Labels};
pub use datasource::{DataSource, HttpDataSource, ProgressEvent, Reuse, SourceRef};
pub use download::{Downloader, Report, SilentReport};
pub use error::{Error, Result};
pub use helper::{BuiltinHelper, CredentialHelper, ExternalHelper, Login, Usage};
pub use listing::Lister;
pub use retry::{IsRetryable, RetryPolicy};
pub use vfs::{DuplicatePolicy, Node, NodeKind, NodeRef, Readiness, Vfs};
