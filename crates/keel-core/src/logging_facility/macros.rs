//! Operation boundary macros
//!
//! All three expand to `tracing` events with `component` set to the calling
//! module, so filters and captures can select on it. Session operations pass
//! `session_id` and, when one entity is concerned, its `identity`.

/// Log the start of an operation
///
/// ```
/// # use keel_core::log_op_start;
/// log_op_start!("flush", session_id = "0190c3e2", flush_id = "0190c3e3");
/// log_op_start!("persist", session_id = "0190c3e2", entity_type = "Pirate");
/// ```
#[macro_export]
macro_rules! log_op_start {
    ($op:expr $(, $($field:tt)+)?) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_START,
            $($($field)+)?
        )
    };
}

/// Log the successful end of an operation
///
/// ```
/// # use keel_core::log_op_end;
/// log_op_end!("find", duration_ms = 1, identity = "Pirate#1", hit = true);
/// log_op_end!("flush", duration_ms = 3, inserts = 2, updates = 1, deletes = 0);
/// ```
#[macro_export]
macro_rules! log_op_end {
    ($op:expr, duration_ms = $duration:expr $(, $($field:tt)+)?) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END,
            duration_ms = $duration,
            $($($field)+)?
        )
    };
}

/// Log a failed operation with its error kind and stable code
///
/// The error is converted into [`ExError`](crate::errors::ExError), so
/// anything with an `Into<ExError>` impl may be passed. The entity named by
/// the error and whether retrying the unit of work can help are recorded
/// alongside the code.
///
/// ```
/// # use keel_core::log_op_error;
/// # use keel_core::{Identity, KeelError};
/// let err = KeelError::StaleVersionConflict {
///     identity: Identity::new("Pirate", 1),
///     expected_version: Some(0),
/// };
/// log_op_error!("flush", err, duration_ms = 10, session_id = "0190c3e2");
/// ```
#[macro_export]
macro_rules! log_op_error {
    ($op:expr, $err:expr, duration_ms = $duration:expr $(, $($field:tt)+)?) => {{
        let ex_err: $crate::errors::ExError = $err.into();
        tracing::error!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END_ERROR,
            duration_ms = $duration,
            err_kind = ?ex_err.kind(),
            err_code = ex_err.code(),
            err_entity = ex_err.entity(),
            retryable = ex_err.kind().is_retryable(),
            detail = ex_err.message(),
            $($($field)+)?
        )
    }};
}
