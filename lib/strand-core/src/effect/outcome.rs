use crate::{EffectError, FiberError};

/// The terminal result of a fiber.
#[derive(Clone, Debug)]
pub enum Outcome<A> {
    /// The fiber produced a value.
    Succeeded(A),

    /// The fiber failed.
    Errored(EffectError),

    /// The fiber was canceled.
    Canceled,
}

impl<A> Outcome<A> {
    /// Returns `true` if the fiber produced a value.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    /// Returns `true` if the fiber failed.
    pub fn is_errored(&self) -> bool {
        matches!(self, Outcome::Errored(_))
    }

    /// Returns `true` if the fiber was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    /// Returns the error, if the fiber failed.
    pub fn error(&self) -> Option<&EffectError> {
        match self {
            Outcome::Errored(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the value, if the fiber produced one.
    pub fn succeeded(self) -> Option<A> {
        match self {
            Outcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Maps the produced value, leaving failure and cancellation untouched.
    pub fn map<B, F>(self, f: F) -> Outcome<B>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Outcome::Succeeded(value) => Outcome::Succeeded(f(value)),
            Outcome::Errored(e) => Outcome::Errored(e),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    /// Returns the exit case corresponding to this outcome.
    pub fn exit_case(&self) -> ExitCase {
        match self {
            Outcome::Succeeded(_) => ExitCase::Succeeded,
            Outcome::Errored(e) => ExitCase::Errored(e.clone()),
            Outcome::Canceled => ExitCase::Canceled,
        }
    }

    /// Converts the outcome into a `Result`.
    ///
    /// Cancellation is reported as [`FiberError::Canceled`].
    pub fn into_result(self) -> Result<A, EffectError> {
        match self {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Errored(e) => Err(e),
            Outcome::Canceled => Err(EffectError::new(FiberError::Canceled)),
        }
    }
}

/// How a guarded region terminated, as seen by its release action.
#[derive(Clone, Debug)]
pub enum ExitCase {
    /// The region completed with a value.
    Succeeded,

    /// The region failed.
    Errored(EffectError),

    /// The region was canceled.
    Canceled,
}

impl ExitCase {
    /// Returns `true` if the region completed with a value.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ExitCase::Succeeded)
    }

    /// Returns `true` if the region failed.
    pub fn is_errored(&self) -> bool {
        matches!(self, ExitCase::Errored(_))
    }

    /// Returns `true` if the region was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExitCase::Canceled)
    }
}
