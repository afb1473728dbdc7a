use crate::error::GenerationError;
use crate::model::{CodeChange, ErrorRecord, FixAttempt};

/// Proposes a change for a failing test.
///
/// Implementations must not touch the disk or git; they only return data.
/// `prior_attempts` holds every settled attempt so far, oldest first.
#[allow(async_fn_in_trait)]
pub trait FixGenerator {
    async fn propose(
        &self,
        error: &ErrorRecord,
        temperature: f64,
        prior_attempts: &[FixAttempt],
    ) -> Result<CodeChange, GenerationError>;
}

impl<T: FixGenerator + ?Sized> FixGenerator for &T {
    async fn propose(
        &self,
        error: &ErrorRecord,
        temperature: f64,
        prior_attempts: &[FixAttempt],
    ) -> Result<CodeChange, GenerationError> {
        (**self).propose(error, temperature, prior_attempts).await
    }
}
