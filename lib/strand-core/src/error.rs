use std::{error::Error as StdError, fmt, sync::Arc};

use strand_error::GenericError;
use tracing::warn;

/// The error channel of an effect.
///
/// `EffectError` wraps a [`GenericError`] behind a shared pointer so that it can be cloned freely: the same error is
/// routinely observed by several parties, such as every fiber joining a failed fiber, or a release action that needs to
/// know why its resource is being released.
///
/// When a second failure happens while handling a first one (for example, a release action failing after the consumer
/// already failed), the first error wins and the second one is attached to it as a _suppressed_ error.
#[derive(Clone)]
pub struct EffectError {
    error: Arc<GenericError>,
    suppressed: Arc<[EffectError]>,
}

impl EffectError {
    /// Creates a new `EffectError` from the given error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::from(GenericError::new(error))
    }

    /// Creates a new `EffectError` from a printable message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from(GenericError::msg(message))
    }

    /// Returns a reference to the underlying generic error.
    pub fn as_generic(&self) -> &GenericError {
        &self.error
    }

    /// Returns `true` if the underlying error is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.is::<E>()
    }

    /// Attempts to downcast the underlying error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns the errors that were suppressed in favor of this one.
    pub fn suppressed(&self) -> &[EffectError] {
        &self.suppressed
    }

    /// Attaches `other` as a suppressed error, returning the combined error.
    pub fn with_suppressed(self, other: EffectError) -> Self {
        let mut suppressed = self.suppressed.to_vec();
        suppressed.push(other);
        Self {
            error: self.error,
            suppressed: suppressed.into(),
        }
    }

    /// Attaches `other`, if any, as a suppressed error, logging it since it would otherwise only be reachable through
    /// [`suppressed`][Self::suppressed].
    pub(crate) fn suppressing(self, other: Option<EffectError>) -> Self {
        match other {
            Some(other) => {
                warn!(error = %self, suppressed = %other, "Suppressed secondary failure while handling an error.");
                self.with_suppressed(other)
            }
            None => self,
        }
    }
}

impl From<GenericError> for EffectError {
    fn from(error: GenericError) -> Self {
        Self {
            error: Arc::new(error),
            suppressed: Arc::from(Vec::new()),
        }
    }
}

impl fmt::Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectError")
            .field("error", &*self.error)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl StdError for EffectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.error.source()
    }
}
