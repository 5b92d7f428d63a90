//! Store error types

use thiserror::Error;

use crate::validation::ValidationErrors;

/// Every store operation is a terminal error boundary: failures come back as
/// one of these variants, never as a panic.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Validation(ValidationErrors),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("No fields to update")]
    NothingToUpdate,

    #[error("{0}")]
    InvalidUpload(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A stored row that no longer decodes into a catalog record.
    #[error("corrupt catalog row: {0}")]
    CorruptRow(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    /// True for failures the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::Validation(_) | StoreError::NothingToUpdate | StoreError::InvalidUpload(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<ValidationErrors> for StoreError {
    fn from(errors: ValidationErrors) -> Self {
        StoreError::Validation(errors)
    }
}

pub(crate) fn corrupt(detail: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow(detail.to_string())
}

pub(crate) fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.message().contains("FOREIGN KEY"))
}
