//! Merge preconditions.
//!
//! The same checks run twice: once advisory over the pool, once under the
//! executor's row locks. Only the second one is authoritative.

use std::collections::HashSet;

use uuid::Uuid;

use super::{
    error::MergeError,
    store::PatientLookup,
};
use crate::models::PatientState;

/// Upper bound on `merged_into` hops walked before a chain is treated as a loop.
pub const MAX_CHAIN_HOPS: usize = 64;

/// Checks, in order: both exist, distinct ids, source active, target active,
/// no cycle. Returns the resolved `(source, target)` states.
pub async fn validate<L>(
    lookup: &mut L,
    source_id: Uuid,
    target_id: Uuid,
) -> Result<(PatientState, PatientState), MergeError>
where
    L: PatientLookup + ?Sized,
{
    let source = lookup
        .patient_state(source_id)
        .await?
        .ok_or(MergeError::PatientNotFound(source_id))?;
    let target = lookup
        .patient_state(target_id)
        .await?
        .ok_or(MergeError::PatientNotFound(target_id))?;

    if source_id == target_id {
        return Err(MergeError::SelfMerge(source_id));
    }
    if !source.is_active() {
        return Err(MergeError::SourceAlreadyMerged(source_id));
    }
    if !target.is_active() {
        return Err(MergeError::TargetAlreadyMerged(target_id));
    }

    ensure_acyclic(lookup, source_id, target).await?;

    Ok((source, target))
}

/// Follows `merged_into` from `target` and fails if it ever reaches
/// `source_id`, revisits a patient, or runs past [`MAX_CHAIN_HOPS`].
pub async fn ensure_acyclic<L>(
    lookup: &mut L,
    source_id: Uuid,
    target: PatientState,
) -> Result<(), MergeError>
where
    L: PatientLookup + ?Sized,
{
    let cycle = || MergeError::CircularMerge {
        source_id,
        target_id: target.patient_id,
    };

    let mut seen = HashSet::from([target.patient_id]);
    let mut next = target.merged_into;

    while let Some(id) = next {
        if id == source_id || !seen.insert(id) || seen.len() > MAX_CHAIN_HOPS {
            return Err(cycle());
        }
        next = match lookup.patient_state(id).await? {
            Some(state) => state.merged_into,
            // dangling pointer ends the chain; it cannot lead back to source
            None => None,
        };
    }

    Ok(())
}

/// Walks `merged_into` from `patient_id` to the surviving active record.
/// The returned chain starts with `patient_id` and ends with the survivor.
pub async fn resolve_chain<L>(lookup: &mut L, patient_id: Uuid) -> Result<Vec<Uuid>, MergeError>
where
    L: PatientLookup + ?Sized,
{
    let mut chain = vec![patient_id];
    let mut current = lookup
        .patient_state(patient_id)
        .await?
        .ok_or(MergeError::PatientNotFound(patient_id))?;

    while let Some(next_id) = current.merged_into {
        if chain.contains(&next_id) || chain.len() > MAX_CHAIN_HOPS {
            return Err(MergeError::CircularMerge {
                source_id: patient_id,
                target_id: next_id,
            });
        }
        chain.push(next_id);
        current = lookup
            .patient_state(next_id)
            .await?
            .ok_or(MergeError::PatientNotFound(next_id))?;
    }

    Ok(chain)
}
