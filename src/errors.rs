use crate::cnpj::InvalidCnpj;

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The submitted identifier is not a valid CNPJ.
    #[error(transparent)]
    InvalidCnpj(#[from] InvalidCnpj),

    /// A database error occurred while persisting the job.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
