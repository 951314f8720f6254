//! Splits reconcile failures into ones that are worth retrying and ones that are not
//!
//! A [`Severity::Transient`] error is returned to the caller, which will requeue the object with a
//! backoff. A [`Severity::Permanent`] error can only be resolved by changing the object itself, so it
//! is recorded in the object's status instead and the reconcile is reported as successful.

use std::{error::Error as StdError, fmt};

pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Severity {
    Permanent,
    Transient,
}

pub trait ClassifiedError: StdError {
    fn severity(&self) -> Severity;

    fn is_permanent(&self) -> bool {
        self.severity() == Severity::Permanent
    }
}

/// Wrapper for errors returned by signers and health checkers that will not go away by retrying.
///
/// Failures of external signers are treated as transient unless they are wrapped in a
/// `PermanentError` somewhere along their source chain.
#[derive(Debug)]
pub struct PermanentError(BoxedError);

impl PermanentError {
    pub fn new(err: impl Into<BoxedError>) -> Self {
        Self(err.into())
    }
}

impl fmt::Display for PermanentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for PermanentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Returns [`Severity::Permanent`] if `err` or any of its sources is a [`PermanentError`].
pub fn severity_of(err: &(dyn StdError + 'static)) -> Severity {
    let mut curr = Some(err);
    while let Some(err) = curr {
        if err.is::<PermanentError>() {
            return Severity::Permanent;
        }
        curr = err.source();
    }
    Severity::Transient
}

/// Boxes `err`, marking it with [`PermanentError`] if it is permanent so that the
/// classification survives type erasure.
pub fn into_boxed<E>(err: E) -> BoxedError
where
    E: ClassifiedError + Send + Sync + 'static,
{
    if err.is_permanent() {
        Box::new(PermanentError::new(err))
    } else {
        Box::new(err)
    }
}
