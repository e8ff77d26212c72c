//! Patient identity resolution and merge engine.
//!
//! `MergeService` is the only entry point the HTTP layer uses. Detection is
//! read-only; merging goes through [`executor::execute`], the single writer of
//! patient merge state, related-entity patient ids and merge logs.

pub mod audit;
pub mod detector;
pub mod error;
pub mod executor;
#[cfg(test)]
pub mod memory_store;
pub mod normalize;
pub mod pg_store;
pub mod similarity;
pub mod store;
pub mod validator;

use std::sync::Arc;

use uuid::Uuid;

pub use error::MergeError;

use self::{
    audit::{MERGE_FAILED_TOTAL, MERGE_TOTAL, MergeEventBus, MergeMetrics},
    executor::MergeCommand,
    similarity::{NameSimilarity, TrigramSimilarity},
    store::{PatientStore, StoreLookup},
};
use crate::models::{MergeCandidate, MergeLog, MergeStrategy, PatientMerged};

pub struct MergeService {
    store: Arc<dyn PatientStore>,
    metrics: Arc<dyn MergeMetrics>,
    events: MergeEventBus,
    similarity: Arc<dyn NameSimilarity>,
    name_threshold: f64,
}

impl MergeService {
    pub fn new(
        store: Arc<dyn PatientStore>,
        metrics: Arc<dyn MergeMetrics>,
        events: MergeEventBus,
        name_threshold: f64,
    ) -> Self {
        Self {
            store,
            metrics,
            events,
            similarity: Arc::new(TrigramSimilarity),
            name_threshold,
        }
    }

    #[cfg(test)]
    pub fn with_similarity(mut self, similarity: Arc<dyn NameSimilarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn events(&self) -> &MergeEventBus {
        &self.events
    }

    /// Scored duplicate pairs among active patients. `strategy = None` runs
    /// every detector strategy.
    pub async fn find_candidates(
        &self,
        strategy: Option<MergeStrategy>,
        min_confidence: Option<f64>,
    ) -> Result<Vec<MergeCandidate>, MergeError> {
        if let Some(s) = strategy {
            if !s.is_detectable() {
                return Err(MergeError::Validation(format!(
                    "strategy '{s}' is not produced by the detector"
                )));
            }
        }
        if let Some(min) = min_confidence {
            if !min.is_finite() || !(0.0..=1.0).contains(&min) {
                return Err(MergeError::Validation(
                    "min_confidence must be between 0 and 1".into(),
                ));
            }
        }

        let strategies: Vec<MergeStrategy> = match strategy {
            Some(s) => vec![s],
            None => MergeStrategy::DETECTABLE.to_vec(),
        };
        let threshold = min_confidence.unwrap_or(self.name_threshold);

        let patients = self.store.active_identities().await?;
        let candidates = detector::find_candidates(
            &patients,
            &strategies,
            threshold,
            min_confidence,
            self.similarity.as_ref(),
        );

        tracing::debug!(
            scanned = patients.len(),
            found = candidates.len(),
            "merge candidate scan complete"
        );
        Ok(candidates)
    }

    /// Advisory precondition check; nothing is locked or written.
    pub async fn validate(&self, source_id: Uuid, target_id: Uuid) -> Result<(), MergeError> {
        let mut lookup = StoreLookup(self.store.as_ref());
        validator::validate(&mut lookup, source_id, target_id).await?;
        Ok(())
    }

    /// Merges `source_id` into `target_id`. On success the event bus is
    /// notified after commit; every outcome is counted.
    pub async fn merge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        strategy: MergeStrategy,
        acting_user_id: Uuid,
    ) -> Result<MergeLog, MergeError> {
        let cmd = MergeCommand {
            source_id,
            target_id,
            strategy,
            acting_user_id,
        };

        let log = match executor::execute(self.store.as_ref(), cmd).await {
            Ok(log) => log,
            Err(e) => {
                self.record_rejection(&e);
                if e.is_retryable() {
                    tracing::warn!(
                        %source_id,
                        %target_id,
                        strategy = strategy.as_str(),
                        "patient merge rolled back: {e}"
                    );
                } else {
                    tracing::info!(
                        %source_id,
                        %target_id,
                        strategy = strategy.as_str(),
                        reason = e.reason(),
                        "patient merge rejected: {e}"
                    );
                }
                return Err(e);
            }
        };

        self.metrics.incr(MERGE_TOTAL, "strategy", strategy.as_str());

        let listeners = self.events.publish(PatientMerged {
            source_patient_id: log.source_patient_id,
            target_patient_id: log.target_patient_id,
            strategy: log.strategy,
            merged_by_user_id: log.merged_by_user_id,
            merge_log_id: log.merge_log_id,
        });

        tracing::info!(
            merge_log_id = %log.merge_log_id,
            %source_id,
            %target_id,
            strategy = strategy.as_str(),
            listeners,
            "patient merged"
        );
        Ok(log)
    }

    /// Counts a merge attempt that failed, including ones refused before
    /// reaching the engine.
    pub fn record_rejection(&self, err: &MergeError) {
        self.metrics.incr(MERGE_FAILED_TOTAL, "reason", err.reason());
    }

    /// Chain from `patient_id` to its surviving active record.
    pub async fn resolve_canonical(&self, patient_id: Uuid) -> Result<Vec<Uuid>, MergeError> {
        let mut lookup = StoreLookup(self.store.as_ref());
        validator::resolve_chain(&mut lookup, patient_id).await
    }

    pub async fn merge_logs(
        &self,
        patient_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<MergeLog>, MergeError> {
        Ok(self.store.list_merge_logs(patient_id, limit).await?)
    }

    pub async fn merge_log(&self, merge_log_id: Uuid) -> Result<Option<MergeLog>, MergeError> {
        Ok(self.store.get_merge_log(merge_log_id).await?)
    }
}
