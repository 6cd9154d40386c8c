//! Step trait and related types.

use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, Instant};

/// Type-safe step name wrapper.
///
/// Names are diagnostic only: they label events and log lines, they never
/// decide control flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a StepName from a type's name (extracts last segment).
    pub fn from_type_name<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        let short_name = full_name.rsplit("::").next().unwrap_or(full_name);
        Self::new(short_name)
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StepName> for StepName {
    fn from(s: &StepName) -> Self {
        s.clone()
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A reusable unit of work that yields an Outcome.
///
/// Most workflows pass closures straight to `WorkflowContext::step`; implement
/// this trait when the same step is shared between workflows or carries its own
/// dependencies.
///
/// # Examples
///
/// ```
/// use senro_core::{async_trait, Step, StepName};
///
/// #[derive(Debug)]
/// struct LoadGreeting;
///
/// #[async_trait]
/// impl Step for LoadGreeting {
///     type Output = String;
///     type Error = std::io::Error;
///
///     async fn execute(&self) -> Result<String, std::io::Error> {
///         Ok("hello".to_string())
///     }
/// }
///
/// assert_eq!(LoadGreeting.name(), StepName::new("LoadGreeting"));
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Value produced on success.
    type Output: Send;
    /// Error produced on failure.
    type Error: Send;

    /// Executes the step logic.
    async fn execute(&self) -> Result<Self::Output, Self::Error>;

    /// Returns the step name.
    ///
    /// By default, uses the type name. Override to provide a custom name.
    fn name(&self) -> StepName {
        StepName::from_type_name::<Self>()
    }
}

/// How a single attempt under a retry policy ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt produced a success.
    Succeeded,
    /// The attempt failed; holds the rendered error.
    Failed(String),
}

/// Record of one try of an operation under a retry policy.
///
/// Only produced when attempt history is requested explicitly.
#[derive(Debug, Clone)]
pub struct StepAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: Instant,
    /// How long the attempt ran.
    pub elapsed: Duration,
    /// Delay slept before the next attempt, if one followed.
    pub delay_before_next: Option<Duration>,
    /// Outcome of this attempt.
    pub outcome: AttemptOutcome,
}

impl StepAttempt {
    /// Returns `true` if this attempt succeeded.
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}
