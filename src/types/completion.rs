//! Three-valued completion state with a severity lattice.
//!
//! A completion is the terminal state of an eventual value:
//!
//! - `Resolved(T)`: the computation produced a value
//! - `Failed(E)`: the computation raised an error
//! - `Cancelled`: the computation was cancelled before producing either
//!
//! These form a severity lattice: `Resolved < Cancelled < Failed`.
//!
//! When aggregating completions (e.g. from a collected batch), the worst
//! completion wins: any failure dominates, otherwise any cancellation,
//! otherwise the batch resolved.

use core::fmt;

/// The terminal state of an eventual value.
///
/// Forms a severity lattice where worse completions dominate during
/// aggregation: `Resolved < Cancelled < Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T, E> {
    /// The computation produced a value.
    Resolved(T),
    /// The computation raised an error.
    Failed(E),
    /// The computation was cancelled.
    Cancelled,
}

impl<T, E> Completion<T, E> {
    /// Returns the severity level of this completion (0 = Resolved, 2 = Failed).
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Resolved(_) => 0,
            Self::Cancelled => 1,
            Self::Failed(_) => 2,
        }
    }

    /// Returns true if this completion is `Resolved`.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if this completion is `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if this completion is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short static label for the completion kind, used in trace events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Resolved(_) => "resolved",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Maps the resolved value using the provided function.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Completion<U, E> {
        match self {
            Self::Resolved(v) => Completion::Resolved(f(v)),
            Self::Failed(e) => Completion::Failed(e),
            Self::Cancelled => Completion::Cancelled,
        }
    }

    /// Maps the failure cause using the provided function.
    pub fn map_err<F2, G: FnOnce(E) -> F2>(self, g: G) -> Completion<T, F2> {
        match self {
            Self::Resolved(v) => Completion::Resolved(v),
            Self::Failed(e) => Completion::Failed(g(e)),
            Self::Cancelled => Completion::Cancelled,
        }
    }

    /// Converts this completion to a standard `Result`, with cancellation
    /// folded into the error channel.
    pub fn into_result(self) -> Result<T, Aborted<E>> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Failed(e) => Err(Aborted::Failed(e)),
            Self::Cancelled => Err(Aborted::Cancelled),
        }
    }

    /// Returns the resolved value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the completion is not `Resolved`.
    #[track_caller]
    pub fn unwrap(self) -> T
    where
        E: fmt::Debug,
    {
        match self {
            Self::Resolved(v) => v,
            Self::Failed(e) => {
                panic!("called `Completion::unwrap()` on a `Failed` value: {e:?}")
            }
            Self::Cancelled => panic!("called `Completion::unwrap()` on a `Cancelled` value"),
        }
    }
}

impl<T, E> From<Result<T, E>> for Completion<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Resolved(v),
            Err(e) => Self::Failed(e),
        }
    }
}

/// The non-resolved half of a completion, for `Result`-shaped consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aborted<E> {
    /// The computation raised an error.
    Failed(E),
    /// The computation was cancelled.
    Cancelled,
}

impl<E> Aborted<E> {
    /// Returns the failure cause, if any.
    pub fn into_cause(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Aborted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Aborted<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Severity Ordering Tests
    // =========================================================================

    #[test]
    fn severity_ordering() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        let cancelled: Completion<i32, &str> = Completion::Cancelled;
        let failed: Completion<i32, &str> = Completion::Failed("error");

        assert!(resolved.severity() < cancelled.severity());
        assert!(cancelled.severity() < failed.severity());
    }

    // =========================================================================
    // Predicate Tests
    // =========================================================================

    #[test]
    fn predicates() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        let failed: Completion<i32, &str> = Completion::Failed("error");
        let cancelled: Completion<i32, &str> = Completion::Cancelled;

        assert!(resolved.is_resolved());
        assert!(!resolved.is_failed());
        assert!(!resolved.is_cancelled());

        assert!(failed.is_failed());
        assert!(!failed.is_resolved());

        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_resolved());
    }

    #[test]
    fn kind_labels() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        let failed: Completion<i32, &str> = Completion::Failed("error");
        let cancelled: Completion<i32, &str> = Completion::Cancelled;

        assert_eq!(resolved.kind(), "resolved");
        assert_eq!(failed.kind(), "failed");
        assert_eq!(cancelled.kind(), "cancelled");
    }

    // =========================================================================
    // Map Operations Tests
    // =========================================================================

    #[test]
    fn map_transforms_resolved_value() {
        let resolved: Completion<i32, &str> = Completion::Resolved(21);
        let mapped = resolved.map(|x| x * 2);
        assert!(matches!(mapped, Completion::Resolved(42)));
    }

    #[test]
    fn map_preserves_failed_and_cancelled() {
        let failed: Completion<i32, &str> = Completion::Failed("error");
        assert!(matches!(failed.map(|x| x * 2), Completion::Failed("error")));

        let cancelled: Completion<i32, &str> = Completion::Cancelled;
        assert!(cancelled.map(|x| x * 2).is_cancelled());
    }

    #[test]
    fn map_err_transforms_cause() {
        let failed: Completion<i32, &str> = Completion::Failed("short");
        let mapped = failed.map_err(str::len);
        assert!(matches!(mapped, Completion::Failed(5)));
    }

    #[test]
    fn map_err_preserves_resolved() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        assert!(matches!(
            resolved.map_err(str::len),
            Completion::Resolved(42)
        ));
    }

    // =========================================================================
    // Conversion Tests
    // =========================================================================

    #[test]
    fn into_result_resolved() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        assert!(matches!(resolved.into_result(), Ok(42)));
    }

    #[test]
    fn into_result_failed() {
        let failed: Completion<i32, &str> = Completion::Failed("error");
        assert!(matches!(
            failed.into_result(),
            Err(Aborted::Failed("error"))
        ));
    }

    #[test]
    fn into_result_cancelled() {
        let cancelled: Completion<i32, &str> = Completion::Cancelled;
        assert!(matches!(cancelled.into_result(), Err(Aborted::Cancelled)));
    }

    #[test]
    fn from_result() {
        let ok: Completion<i32, &str> = Result::Ok(42).into();
        assert!(matches!(ok, Completion::Resolved(42)));

        let err: Completion<i32, &str> = Result::Err("error").into();
        assert!(matches!(err, Completion::Failed("error")));
    }

    // =========================================================================
    // Unwrap Tests
    // =========================================================================

    #[test]
    fn unwrap_returns_value_on_resolved() {
        let resolved: Completion<i32, &str> = Completion::Resolved(42);
        assert_eq!(resolved.unwrap(), 42);
    }

    #[test]
    #[should_panic(expected = "called `Completion::unwrap()` on a `Failed` value")]
    fn unwrap_panics_on_failed() {
        let failed: Completion<i32, &str> = Completion::Failed("error");
        let _ = failed.unwrap();
    }

    #[test]
    #[should_panic(expected = "called `Completion::unwrap()` on a `Cancelled` value")]
    fn unwrap_panics_on_cancelled() {
        let cancelled: Completion<i32, &str> = Completion::Cancelled;
        let _ = cancelled.unwrap();
    }

    // =========================================================================
    // Display Tests
    // =========================================================================

    #[test]
    fn aborted_display() {
        let failed: Aborted<&str> = Aborted::Failed("boom");
        assert_eq!(failed.to_string(), "boom");

        let cancelled: Aborted<&str> = Aborted::Cancelled;
        assert_eq!(cancelled.to_string(), "cancelled");
    }

    #[test]
    fn aborted_into_cause() {
        let failed: Aborted<&str> = Aborted::Failed("boom");
        assert_eq!(failed.into_cause(), Some("boom"));

        let cancelled: Aborted<&str> = Aborted::Cancelled;
        assert_eq!(cancelled.into_cause(), None);
    }
}
