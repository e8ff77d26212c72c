use chrono::Utc;
use uuid::Uuid;

use super::{
    error::MergeError,
    store::{PatientStore, RELATED_ENTITIES, RelatedEntity},
    validator::validate,
};
use crate::models::{MergeLog, MergeStrategy, NewMergeLog, RelationshipSnapshot};

#[derive(Debug, Clone, Copy)]
pub struct MergeCommand {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub strategy: MergeStrategy,
    pub acting_user_id: Uuid,
}

/// Runs one merge as a single transaction:
/// lock both rows, re-validate under the lock, move every related row,
/// retire the source, append the merge log, commit.
///
/// Any early return drops the transaction, which rolls it back.
pub async fn execute(store: &dyn PatientStore, cmd: MergeCommand) -> Result<MergeLog, MergeError> {
    if cmd.acting_user_id.is_nil() {
        return Err(MergeError::Validation("acting_user_id is required".into()));
    }

    let mut tx = store.begin().await?;

    tx.lock_patients(&[cmd.source_id, cmd.target_id]).await?;
    validate(&mut *tx, cmd.source_id, cmd.target_id).await?;

    let mut snapshot = RelationshipSnapshot::new();
    for entity in RELATED_ENTITIES {
        if entity == RelatedEntity::PhoneNumber {
            // one primary number per patient
            tx.demote_source_primary_phone(cmd.source_id, cmd.target_id)
                .await?;
        }

        let moved = tx.reassign(entity, cmd.source_id, cmd.target_id).await?;

        let left = tx.count_references(entity, cmd.source_id).await?;
        if left != 0 {
            return Err(MergeError::Transaction(format!(
                "{left} {} rows still reference patient {} after reassignment",
                entity.table(),
                cmd.source_id
            )));
        }

        if moved > 0 {
            snapshot.insert(entity.snapshot_key().to_string(), moved);
        }
    }

    tx.mark_merged(cmd.source_id, cmd.target_id).await?;

    let log = tx
        .insert_merge_log(&NewMergeLog {
            source_patient_id: cmd.source_id,
            target_patient_id: cmd.target_id,
            strategy: cmd.strategy,
            merged_by_user_id: cmd.acting_user_id,
            merged_at: Utc::now(),
            relationship_snapshot: snapshot,
        })
        .await?;

    tx.commit().await?;

    Ok(log)
}
