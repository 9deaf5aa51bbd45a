//! Façade error codes: one stable negative code and string per failure
//! class, plus the thread-local last-error slot every fallible call
//! updates.

use std::cell::Cell;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("memory allocation failed")]
    MemoryAllocation,
    #[error("translation failed")]
    TranslationFailed,
    #[error("execution failed")]
    ExecutionFailed,
    #[error("not implemented")]
    NotImplemented,
}

impl CoreError {
    /// Stable numeric code (positive here; the C shim negates).
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            CoreError::InvalidParameter => 1,
            CoreError::MemoryAllocation => 2,
            CoreError::TranslationFailed => 3,
            CoreError::ExecutionFailed => 4,
            CoreError::NotImplemented => 5,
        }
    }
}

/// Stable descriptions, one per code; code 0 is success.
#[must_use]
pub fn error_string(code: i32) -> &'static str {
    match code {
        0 => "no error",
        1 => "invalid parameter",
        2 => "memory allocation failed",
        3 => "translation failed",
        4 => "execution failed",
        5 => "not implemented",
        _ => "unknown error",
    }
}

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// Last error code observed on this thread; 0 when the most recent fallible
/// call succeeded.
#[must_use]
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|c| c.set(0));
}

pub(crate) fn set_last_error(err: CoreError) -> CoreError {
    LAST_ERROR.with(|c| c.set(err.code()));
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_strings_are_stable() {
        assert_eq!(CoreError::InvalidParameter.code(), 1);
        assert_eq!(CoreError::NotImplemented.code(), 5);
        assert_eq!(error_string(0), "no error");
        assert_eq!(error_string(3), "translation failed");
        assert_eq!(error_string(99), "unknown error");
    }

    #[test]
    fn last_error_is_thread_local() {
        clear_last_error();
        assert_eq!(last_error(), 0);
        let _ = set_last_error(CoreError::TranslationFailed);
        assert_eq!(last_error(), 3);
        std::thread::spawn(|| assert_eq!(last_error(), 0))
            .join()
            .unwrap();
        clear_last_error();
    }
}
