//! Structured logging for persistence sessions
//!
//! Every public session operation is bracketed by a start event and either
//! an end or an error event, each carrying `op`, `event` and the session
//! id so a single unit of work can be followed through the log.
//!
//! ```rust
//! use keel_core::logging_facility::{init, Profile};
//!
//! init(Profile::Development);
//! ```
//!
//! - `log_op_start!(op, ...)` marks the start of an operation
//! - `log_op_end!(op, duration_ms = ..., ...)` marks a successful end
//! - `log_op_error!(op, err, duration_ms = ..., ...)` marks a failed end,
//!   adding `err_kind`, `err_code`, `err_entity` and `retryable` from
//!   [`crate::errors::ExError`]

pub mod init;
pub mod macros;
pub mod test_capture;

pub use init::{init, Profile};
pub use test_capture::{init_test_capture, CapturedEvent, TestCapture};
