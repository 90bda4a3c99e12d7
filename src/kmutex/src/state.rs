use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a task context, return `Err(RestrictedContext)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::RestrictedContext)
    } else {
        Ok(())
    }
}
