use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MergeLog, NewMergeLog, PatientIdentity, PatientState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A table that carries a foreign key to `patient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelatedEntity {
    Appointment,
    Encounter,
    Sale,
    StockRecord,
    MediaAttachment,
    PhoneNumber,
    Task,
}

/// Every related-entity type the executor reassigns. New patient-owned tables
/// are added here and nowhere else.
pub const RELATED_ENTITIES: [RelatedEntity; 7] = [
    RelatedEntity::Appointment,
    RelatedEntity::Encounter,
    RelatedEntity::Sale,
    RelatedEntity::StockRecord,
    RelatedEntity::MediaAttachment,
    RelatedEntity::PhoneNumber,
    RelatedEntity::Task,
];

impl RelatedEntity {
    pub fn table(self) -> &'static str {
        match self {
            RelatedEntity::Appointment => "appointment",
            RelatedEntity::Encounter => "clinical_encounter",
            RelatedEntity::Sale => "sale",
            RelatedEntity::StockRecord => "stock_record",
            RelatedEntity::MediaAttachment => "media_attachment",
            RelatedEntity::PhoneNumber => "phone_number",
            RelatedEntity::Task => "task",
        }
    }

    pub fn patient_column(self) -> &'static str {
        "patient_id"
    }

    /// Key used in the merge log relationship snapshot.
    pub fn snapshot_key(self) -> &'static str {
        match self {
            RelatedEntity::Appointment => "appointments",
            RelatedEntity::Encounter => "encounters",
            RelatedEntity::Sale => "sales",
            RelatedEntity::StockRecord => "stock_records",
            RelatedEntity::MediaAttachment => "media_attachments",
            RelatedEntity::PhoneNumber => "phone_numbers",
            RelatedEntity::Task => "tasks",
        }
    }
}

/// Point reads of patient merge state. Implemented by the store (outside any
/// transaction) and by an open [`MergeTx`] (inside one).
#[async_trait]
pub trait PatientLookup: Send {
    async fn patient_state(&mut self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError>;
}

#[async_trait]
pub trait PatientStore: Send + Sync {
    /// Identity fields of every unmerged patient, whatever its DCMS status.
    async fn active_identities(&self) -> Result<Vec<PatientIdentity>, StoreError>;

    async fn patient_state(&self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError>;

    /// Opens a transaction. Dropping the returned value without calling
    /// [`MergeTx::commit`] rolls it back.
    async fn begin(&self) -> Result<Box<dyn MergeTx>, StoreError>;

    /// Newest first. With `patient_id`, only logs where it was source or target.
    async fn list_merge_logs(
        &self,
        patient_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<MergeLog>, StoreError>;

    async fn get_merge_log(&self, merge_log_id: Uuid) -> Result<Option<MergeLog>, StoreError>;
}

#[async_trait]
pub trait MergeTx: PatientLookup {
    /// Exclusively locks the given patient rows for the rest of the
    /// transaction and returns whichever of them exist.
    async fn lock_patients(&mut self, patient_ids: &[Uuid]) -> Result<Vec<PatientState>, StoreError>;

    async fn count_references(
        &mut self,
        entity: RelatedEntity,
        patient_id: Uuid,
    ) -> Result<u64, StoreError>;

    /// Points every `entity` row of `from` at `to`, returning the moved count.
    async fn reassign(
        &mut self,
        entity: RelatedEntity,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError>;

    /// Clears the primary flag on `source_id`'s phone numbers when
    /// `target_id` already has a primary one. Returns the rows changed.
    async fn demote_source_primary_phone(
        &mut self,
        source_id: Uuid,
        target_id: Uuid,
    ) -> Result<u64, StoreError>;

    async fn mark_merged(&mut self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError>;

    async fn insert_merge_log(&mut self, log: &NewMergeLog) -> Result<MergeLog, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Adapts a shared store to [`PatientLookup`] for advisory reads.
pub struct StoreLookup<'a>(pub &'a dyn PatientStore);

#[async_trait]
impl PatientLookup for StoreLookup<'_> {
    async fn patient_state(&mut self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError> {
        self.0.patient_state(patient_id).await
    }
}
