use thiserror::Error;
use uuid::Uuid;

use super::store::StoreError;

/// Every way a merge request (or a candidate query) can be refused.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("patient {0} not found")]
    PatientNotFound(Uuid),

    #[error("patient {0} cannot be merged into itself")]
    SelfMerge(Uuid),

    #[error("source patient {0} is already merged")]
    SourceAlreadyMerged(Uuid),

    #[error("target patient {0} is already merged")]
    TargetAlreadyMerged(Uuid),

    #[error("merging {source_id} into {target_id} would create a merge cycle")]
    CircularMerge { source_id: Uuid, target_id: Uuid },

    #[error("{0}")]
    Validation(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl MergeError {
    /// Stable reason code, used on the wire and as the metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            MergeError::PatientNotFound(_) => "PATIENT_NOT_FOUND",
            MergeError::SelfMerge(_) => "SELF_MERGE",
            MergeError::SourceAlreadyMerged(_) => "SOURCE_ALREADY_MERGED",
            MergeError::TargetAlreadyMerged(_) => "TARGET_ALREADY_MERGED",
            MergeError::CircularMerge { .. } => "CIRCULAR_MERGE",
            MergeError::Validation(_) => "VALIDATION_ERROR",
            MergeError::Transaction(_) => "TRANSACTION_ERROR",
        }
    }

    /// Only infrastructure failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MergeError::Transaction(_))
    }
}

impl From<StoreError> for MergeError {
    fn from(e: StoreError) -> Self {
        MergeError::Transaction(e.to_string())
    }
}
