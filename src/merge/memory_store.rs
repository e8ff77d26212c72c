//! In-process [`PatientStore`] for tests.
//!
//! A transaction holds the store mutex for its whole life and edits a private
//! copy of the data, which replaces the shared data only on commit.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::store::{MergeTx, PatientLookup, PatientStore, RelatedEntity, StoreError};
use crate::models::{
    MergeLog, NewMergeLog, PatientIdentity, PatientState, MergeState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPatient {
    pub identity: PatientIdentity,
    pub merge_state: MergeState,
    pub merged_into: Option<Uuid>,
}

impl MemoryPatient {
    fn state(&self) -> PatientState {
        PatientState {
            patient_id: self.identity.patient_id,
            merge_state: self.merge_state,
            merged_into: self.merged_into,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPhone {
    pub number: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryData {
    /// `identity.phones` is left empty; numbers live in `phone_numbers`.
    pub patients: BTreeMap<Uuid, MemoryPatient>,
    /// row id -> owning patient, per related-entity table
    pub related: BTreeMap<RelatedEntity, BTreeMap<Uuid, Uuid>>,
    /// phone_number row id -> number columns; ownership is in `related`
    pub phone_numbers: BTreeMap<Uuid, MemoryPhone>,
    pub merge_logs: Vec<MergeLog>,
}

impl MemoryData {
    fn phones_of(&self, patient_id: Uuid) -> Vec<(Uuid, &MemoryPhone)> {
        self.related
            .get(&RelatedEntity::PhoneNumber)
            .into_iter()
            .flatten()
            .filter(|(_, owner)| **owner == patient_id)
            .filter_map(|(row, _)| self.phone_numbers.get(row).map(|p| (*row, p)))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryPatientStore {
    data: Arc<Mutex<MemoryData>>,
    next_created: AtomicI64,
    fail_on: std::sync::Mutex<Option<RelatedEntity>>,
}

impl MemoryPatientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patients are created one minute apart, in call order. `phone` becomes
    /// the patient's primary phone_number row.
    pub async fn add_patient(
        &self,
        first_name: &str,
        last_name: &str,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> Uuid {
        let minute = self.next_created.fetch_add(1, Ordering::SeqCst);
        let created_at =
            Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap() + Duration::minutes(minute);
        let patient_id = Uuid::new_v4();
        let patient = MemoryPatient {
            identity: PatientIdentity {
                patient_id,
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                phones: Vec::new(),
                email: email.map(String::from),
                created_at,
            },
            merge_state: MergeState::Active,
            merged_into: None,
        };
        self.data.lock().await.patients.insert(patient_id, patient);
        if let Some(number) = phone {
            self.add_phone(patient_id, number, true).await;
        }
        patient_id
    }

    pub async fn add_phone(&self, patient_id: Uuid, number: &str, is_primary: bool) -> Uuid {
        let mut data = self.data.lock().await;
        let row = Uuid::new_v4();
        data.related
            .entry(RelatedEntity::PhoneNumber)
            .or_default()
            .insert(row, patient_id);
        data.phone_numbers.insert(
            row,
            MemoryPhone {
                number: number.to_string(),
                is_primary,
            },
        );
        row
    }

    /// `(number, is_primary)` for every phone row the patient owns.
    pub async fn phones(&self, patient_id: Uuid) -> Vec<(String, bool)> {
        let data = self.data.lock().await;
        let phones = data
            .phones_of(patient_id)
            .into_iter()
            .map(|(_, p)| (p.number.clone(), p.is_primary))
            .collect();
        phones
    }

    pub async fn add_related(&self, entity: RelatedEntity, patient_id: Uuid, rows: usize) {
        let mut data = self.data.lock().await;
        let table = data.related.entry(entity).or_default();
        for _ in 0..rows {
            table.insert(Uuid::new_v4(), patient_id);
        }
    }

    pub async fn count(&self, entity: RelatedEntity, patient_id: Uuid) -> u64 {
        let data = self.data.lock().await;
        count_in(&data, entity, patient_id)
    }

    pub async fn state(&self, patient_id: Uuid) -> Option<PatientState> {
        self.data.lock().await.patients.get(&patient_id).map(MemoryPatient::state)
    }

    pub async fn snapshot(&self) -> MemoryData {
        self.data.lock().await.clone()
    }

    /// Makes every later `reassign` of `entity` fail inside the transaction.
    pub fn fail_reassign_on(&self, entity: Option<RelatedEntity>) {
        if let Ok(mut slot) = self.fail_on.lock() {
            *slot = entity;
        }
    }
}

fn count_in(data: &MemoryData, entity: RelatedEntity, patient_id: Uuid) -> u64 {
    data.related
        .get(&entity)
        .map(|rows| rows.values().filter(|p| **p == patient_id).count() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl PatientStore for MemoryPatientStore {
    async fn active_identities(&self) -> Result<Vec<PatientIdentity>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .patients
            .values()
            .filter(|p| p.merge_state == MergeState::Active)
            .map(|p| {
                let mut identity = p.identity.clone();
                identity.phones = data
                    .phones_of(identity.patient_id)
                    .into_iter()
                    .map(|(_, phone)| phone.number.clone())
                    .collect();
                identity
            })
            .collect())
    }

    async fn patient_state(&self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError> {
        Ok(self.state(patient_id).await)
    }

    async fn begin(&self) -> Result<Box<dyn MergeTx>, StoreError> {
        let guard = Arc::clone(&self.data).lock_owned().await;
        let work = (*guard).clone();
        let fail_on = self.fail_on.lock().ok().and_then(|slot| *slot);
        Ok(Box::new(MemoryTx {
            guard,
            work,
            fail_on,
        }))
    }

    async fn list_merge_logs(
        &self,
        patient_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<MergeLog>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .merge_logs
            .iter()
            .rev()
            .filter(|l| {
                patient_id.is_none_or(|p| l.source_patient_id == p || l.target_patient_id == p)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_merge_log(&self, merge_log_id: Uuid) -> Result<Option<MergeLog>, StoreError> {
        let data = self.data.lock().await;
        Ok(data
            .merge_logs
            .iter()
            .find(|l| l.merge_log_id == merge_log_id)
            .cloned())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryData>,
    work: MemoryData,
    fail_on: Option<RelatedEntity>,
}

#[async_trait]
impl PatientLookup for MemoryTx {
    async fn patient_state(&mut self, patient_id: Uuid) -> Result<Option<PatientState>, StoreError> {
        Ok(self.work.patients.get(&patient_id).map(MemoryPatient::state))
    }
}

#[async_trait]
impl MergeTx for MemoryTx {
    async fn lock_patients(&mut self, patient_ids: &[Uuid]) -> Result<Vec<PatientState>, StoreError> {
        // the store mutex is already held
        Ok(patient_ids
            .iter()
            .filter_map(|id| self.work.patients.get(id).map(MemoryPatient::state))
            .collect())
    }

    async fn count_references(
        &mut self,
        entity: RelatedEntity,
        patient_id: Uuid,
    ) -> Result<u64, StoreError> {
        Ok(count_in(&self.work, entity, patient_id))
    }

    async fn reassign(
        &mut self,
        entity: RelatedEntity,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError> {
        if self.fail_on == Some(entity) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on {}",
                entity.table()
            )));
        }
        let mut moved = 0;
        if let Some(rows) = self.work.related.get_mut(&entity) {
            for owner in rows.values_mut().filter(|p| **p == from) {
                *owner = to;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn demote_source_primary_phone(
        &mut self,
        source_id: Uuid,
        target_id: Uuid,
    ) -> Result<u64, StoreError> {
        let target_has_primary = self
            .work
            .phones_of(target_id)
            .iter()
            .any(|(_, p)| p.is_primary);
        if !target_has_primary {
            return Ok(0);
        }

        let rows: Vec<Uuid> = self
            .work
            .phones_of(source_id)
            .into_iter()
            .filter(|(_, p)| p.is_primary)
            .map(|(row, _)| row)
            .collect();
        for row in &rows {
            if let Some(phone) = self.work.phone_numbers.get_mut(row) {
                phone.is_primary = false;
            }
        }
        Ok(rows.len() as u64)
    }

    async fn mark_merged(&mut self, source_id: Uuid, target_id: Uuid) -> Result<(), StoreError> {
        let patient = self
            .work
            .patients
            .get_mut(&source_id)
            .filter(|p| p.merge_state == MergeState::Active)
            .ok_or_else(|| {
                StoreError::Unavailable(format!("patient {source_id} changed state while locked"))
            })?;
        patient.merge_state = MergeState::Merged;
        patient.merged_into = Some(target_id);
        Ok(())
    }

    async fn insert_merge_log(&mut self, log: &NewMergeLog) -> Result<MergeLog, StoreError> {
        let row = MergeLog {
            merge_log_id: Uuid::new_v4(),
            source_patient_id: log.source_patient_id,
            target_patient_id: log.target_patient_id,
            strategy: log.strategy,
            merged_by_user_id: log.merged_by_user_id,
            merged_at: log.merged_at,
            relationship_snapshot: log.relationship_snapshot.clone(),
        };
        self.work.merge_logs.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            mut guard, work, ..
        } = *self;
        *guard = work;
        Ok(())
    }
}
