//! SonicFix client synchronization layer
//!
//! Keeps a local, persisted mirror of job state and reconciles it against
//! the server's status API by polling. The server is authoritative: the
//! mirror is a best-effort cache whose optimistic in-flight flags are
//! never trusted across a restart.

pub mod error;
pub mod mirror;
pub mod poller;

pub use error::ClientError;
pub use mirror::{JobMirror, JobSnapshot};
pub use poller::StatusPoller;
