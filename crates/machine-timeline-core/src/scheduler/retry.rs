use std::time::Duration;
use tracing::warn;

use crate::error::{AnalysisError, CoreError, DatabaseError, ErrorContext, Result};

/// Run `f` until it succeeds, fails with a non-transient error or has been
/// tried `max_attempts` times. A storage error still transient after the
/// last attempt becomes a `TransientStorageFailure` carrying `context`.
pub fn retry_transient<T, F>(
    max_attempts: u32,
    backoff: Duration,
    context: &ErrorContext,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    machine_id = context.machine_id,
                    attempt,
                    error = %err,
                    "transient storage failure, retrying"
                );
                std::thread::sleep(backoff * attempt);
                attempt += 1;
            }
            Err(CoreError::Database(source)) if source.is_transient() => {
                return Err(AnalysisError::TransientStorageFailure {
                    context: context.clone(),
                    source,
                }
                .into())
            }
            Err(err) => return Err(err),
        }
    }
}

/// Whether `err` must stop the worker instead of failing one modification.
pub(crate) fn is_fatal(err: &CoreError) -> bool {
    err.is_transient()
        || matches!(
            err,
            CoreError::Analysis(AnalysisError::InvariantViolation { .. })
                | CoreError::Database(DatabaseError::Poisoned)
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locked() -> CoreError {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )
        .into()
    }

    #[test]
    fn succeeds_after_a_transient_failure() {
        let mut calls = 0;
        let value = retry_transient(3, Duration::ZERO, &ErrorContext::machine(1), || {
            calls += 1;
            if calls < 2 {
                Err(locked())
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn gives_up_with_a_transient_storage_failure() {
        let mut calls = 0;
        let err = retry_transient::<(), _>(2, Duration::ZERO, &ErrorContext::machine(4), || {
            calls += 1;
            Err(locked())
        })
        .unwrap_err();
        assert_eq!(calls, 2);
        match err {
            CoreError::Analysis(AnalysisError::TransientStorageFailure { context, source }) => {
                assert_eq!(context.machine_id, 4);
                assert!(matches!(source, DatabaseError::Busy));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_transient::<(), _>(5, Duration::ZERO, &ErrorContext::machine(1), || {
            calls += 1;
            Err(CoreError::Custom("bad".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(!is_fatal(&err));
    }
}
