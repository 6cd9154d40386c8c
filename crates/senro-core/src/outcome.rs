//! The success-or-failure value every step produces.

/// Result of a step: exactly one of `Ok(value)` or `Err(error)`.
///
/// `Outcome` is a plain [`Result`]; the alias names the role it plays in a
/// workflow. Failures are values, never unwinding.
pub type Outcome<T, E> = Result<T, E>;

/// Constructs a successful outcome.
pub fn success<T, E>(value: T) -> Outcome<T, E> {
    Ok(value)
}

/// Constructs a failed outcome.
pub fn failure<T, E>(error: E) -> Outcome<T, E> {
    Err(error)
}

/// Railway combinators on [`Outcome`].
///
/// # Examples
///
/// ```
/// use senro_core::{failure, success, Outcome, OutcomeExt};
///
/// let ok: Outcome<u32, String> = success(2);
/// assert_eq!(ok.fold(|v| v * 10, |_| 0), 20);
///
/// let err: Outcome<u32, &str> = failure("missing");
/// assert_eq!(err.map_failure(str::len), Err(7));
/// ```
pub trait OutcomeExt<T, E>: Sized {
    /// Returns `true` on the success track.
    fn is_success(&self) -> bool;

    /// Returns `true` on the failure track.
    fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Collapses both tracks into one value.
    fn fold<R>(self, on_success: impl FnOnce(T) -> R, on_failure: impl FnOnce(E) -> R) -> R;

    /// Transforms the failure; a success passes through untouched.
    fn map_failure<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F>;
}

impl<T, E> OutcomeExt<T, E> for Outcome<T, E> {
    fn is_success(&self) -> bool {
        self.is_ok()
    }

    fn fold<R>(self, on_success: impl FnOnce(T) -> R, on_failure: impl FnOnce(E) -> R) -> R {
        match self {
            Ok(value) => on_success(value),
            Err(error) => on_failure(error),
        }
    }

    fn map_failure<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F> {
        self.map_err(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_failure_is_identity_on_success() {
        let outcome: Outcome<&str, u32> = success("value");
        let mapped = outcome.map_failure(|code| code * 2);
        assert_eq!(mapped, Ok("value"));
    }

    #[test]
    fn test_map_failure_applies_to_failure() {
        let outcome: Outcome<(), u32> = failure(21);
        assert_eq!(outcome.map_failure(|code| code * 2), Err(42));
    }

    #[test]
    fn test_tracks_are_exclusive() {
        let ok: Outcome<u8, u8> = success(1);
        let err: Outcome<u8, u8> = failure(1);
        assert!(ok.is_success() && !ok.is_failure());
        assert!(err.is_failure() && !err.is_success());
    }

    #[test]
    fn test_fold_covers_both_tracks() {
        let describe = |o: Outcome<u8, &str>| o.fold(|v| format!("ok {}", v), |e| format!("err {}", e));
        assert_eq!(describe(success(3)), "ok 3");
        assert_eq!(describe(failure("nope")), "err nope");
    }
}
