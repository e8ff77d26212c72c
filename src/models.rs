use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::merge::{MergeError, MergeService, audit::CounterRegistry};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub merge: Arc<MergeService>,
    pub metrics: Arc<CounterRegistry>,
}

/* -------------------------
   Patient identity
--------------------------*/

/// patient.merge_state: 0 active, 1 merged.
/// Independent of the DCMS `patient.status` lifecycle column (0..3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MergeState {
    Active = 0,
    Merged = 1,
}

/// Raw identity columns of an active patient, as read for duplicate detection.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PatientIdentity {
    pub patient_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Every `phone_number.phone_number` the patient owns.
    pub phones: Vec<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The merge-relevant slice of a patient row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct PatientState {
    pub patient_id: Uuid,
    pub merge_state: MergeState,
    pub merged_into: Option<Uuid>,
}

impl PatientState {
    pub fn is_active(&self) -> bool {
        self.merge_state == MergeState::Active
    }
}

/* -------------------------
   Strategies & candidates
--------------------------*/

/// merge_log.strategy: 0 phone_exact, 1 email_exact, 2 name_trgm, 3 manual, 4 other
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MergeStrategy {
    PhoneExact = 0,
    EmailExact = 1,
    NameTrgm = 2,
    Manual = 3,
    Other = 4,
}

impl MergeStrategy {
    /// Strategies the detector runs, in tie-break order.
    pub const DETECTABLE: [MergeStrategy; 3] = [
        MergeStrategy::PhoneExact,
        MergeStrategy::EmailExact,
        MergeStrategy::NameTrgm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::PhoneExact => "phone_exact",
            MergeStrategy::EmailExact => "email_exact",
            MergeStrategy::NameTrgm => "name_trgm",
            MergeStrategy::Manual => "manual",
            MergeStrategy::Other => "other",
        }
    }

    pub fn is_detectable(self) -> bool {
        Self::DETECTABLE.contains(&self)
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "phone_exact" => Ok(MergeStrategy::PhoneExact),
            "email_exact" => Ok(MergeStrategy::EmailExact),
            "name_trgm" => Ok(MergeStrategy::NameTrgm),
            "manual" => Ok(MergeStrategy::Manual),
            "other" => Ok(MergeStrategy::Other),
            other => Err(MergeError::Validation(format!(
                "unknown strategy '{other}', expected phone_exact, email_exact, name_trgm, manual or other"
            ))),
        }
    }
}

/// Unconfirmed duplicate pair. `target_id` is the older record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeCandidate {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub strategy: MergeStrategy,
    pub confidence: f64,
}

/* -------------------------
   Audit trail
--------------------------*/

/// Moved row counts keyed by related-entity name.
pub type RelationshipSnapshot = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeLog {
    pub merge_log_id: Uuid,
    pub source_patient_id: Uuid,
    pub target_patient_id: Uuid,
    pub strategy: MergeStrategy,
    pub merged_by_user_id: Uuid,
    pub merged_at: DateTime<Utc>,
    pub relationship_snapshot: RelationshipSnapshot,
}

#[derive(Debug, FromRow)]
pub struct MergeLogRow {
    pub merge_log_id: Uuid,
    pub source_patient_id: Uuid,
    pub target_patient_id: Uuid,
    pub strategy: MergeStrategy,
    pub merged_by_user_id: Uuid,
    pub merged_at: DateTime<Utc>,
    pub relationship_snapshot: sqlx::types::Json<RelationshipSnapshot>,
}

impl From<MergeLogRow> for MergeLog {
    fn from(row: MergeLogRow) -> Self {
        MergeLog {
            merge_log_id: row.merge_log_id,
            source_patient_id: row.source_patient_id,
            target_patient_id: row.target_patient_id,
            strategy: row.strategy,
            merged_by_user_id: row.merged_by_user_id,
            merged_at: row.merged_at,
            relationship_snapshot: row.relationship_snapshot.0,
        }
    }
}

/// Everything the executor hands to the store to append one audit row.
#[derive(Debug, Clone)]
pub struct NewMergeLog {
    pub source_patient_id: Uuid,
    pub target_patient_id: Uuid,
    pub strategy: MergeStrategy,
    pub merged_by_user_id: Uuid,
    pub merged_at: DateTime<Utc>,
    pub relationship_snapshot: RelationshipSnapshot,
}

/// Post-commit domain event. Identifiers only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientMerged {
    pub source_patient_id: Uuid,
    pub target_patient_id: Uuid,
    pub strategy: MergeStrategy,
    pub merged_by_user_id: Uuid,
    pub merge_log_id: Uuid,
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Deserialize)]
pub struct CandidatesQuery {
    pub strategy: Option<String>,
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub strategy: String,
    pub acting_user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub merge_log_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub source_id: Uuid,
    pub target_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct MergeLogQuery {
    pub patient_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CanonicalPatientResponse {
    pub data: CanonicalPatientData,
}

#[derive(Debug, Serialize)]
pub struct CanonicalPatientData {
    pub requested_patient_id: Uuid,
    pub canonical_patient_id: Uuid,
    /// Patients walked through, starting with the requested one.
    pub chain: Vec<Uuid>,
}

/* -------------------------
   Helpers
--------------------------*/

/// dcms_user.roles values:
/// 0 Patient, 1 Admin, 2 Manager, 3 Doctor, 4 Receptionist
pub fn role_to_string(role: i16) -> &'static str {
    match role {
        0 => "patient",
        1 => "admin",
        2 => "manager",
        3 => "doctor",
        4 => "receptionist",
        _ => "unknown",
    }
}
