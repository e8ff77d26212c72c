// src/routes/merge_routes.rs

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use crate::{
    error::ApiError,
    merge::MergeError,
    middleware::auth_context::AuthContext,
    models::{
        role_to_string, AppState, CandidatesQuery, CanonicalPatientData, CanonicalPatientResponse,
        MergeCandidate, MergeLog, MergeLogQuery, MergeRequest, MergeResponse, MergeStrategy,
        OkData, OkResponse, ValidateRequest,
    },
};

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/merge", post(merge_patients))
        .route("/merge/candidates", get(list_candidates))
        .route("/merge/validate", post(validate_merge))
        .route("/merges", get(list_merge_logs))
        .route("/merges/{merge_log_id}", get(get_merge_log))
        .route("/patients/{patient_id}/canonical", get(get_canonical_patient))
}

fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if !auth.is_staff() {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            format!("role '{}' cannot manage patient merges", role_to_string(auth.role)),
        ));
    }
    Ok(())
}

pub async fn list_candidates(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Query(q), _): WithRejection<Query<CandidatesQuery>, ApiError>,
) -> Result<Json<Vec<MergeCandidate>>, ApiError> {
    ensure_staff(&auth)?;

    let strategy = q
        .strategy
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<MergeStrategy>)
        .transpose()?;

    let candidates = state.merge.find_candidates(strategy, q.min_confidence).await?;

    Ok(Json(candidates))
}

pub async fn merge_patients(
    State(state): State<AppState>,
    auth: AuthContext,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<MergeResponse>, ApiError> {
    ensure_staff(&auth)?;

    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let e = MergeError::Validation(rejection.body_text());
            state.merge.record_rejection(&e);
            return Err(e.into());
        }
    };

    if req.acting_user_id != auth.user_id {
        return Err(ApiError::Forbidden(
            "FORBIDDEN",
            "acting_user_id must be the signed-in user".to_string(),
        ));
    }

    let strategy = match req.strategy.parse::<MergeStrategy>() {
        Ok(s) => s,
        Err(e) => {
            state.merge.record_rejection(&e);
            return Err(e.into());
        }
    };

    tracing::debug!(
        session_token_id = %auth.session_token_id,
        source_id = %req.source_id,
        target_id = %req.target_id,
        "merge requested"
    );

    let log = state
        .merge
        .merge(req.source_id, req.target_id, strategy, req.acting_user_id)
        .await?;

    Ok(Json(MergeResponse {
        merge_log_id: log.merge_log_id,
    }))
}

pub async fn validate_merge(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Json(req), _): WithRejection<Json<ValidateRequest>, ApiError>,
) -> Result<Json<OkResponse>, ApiError> {
    ensure_staff(&auth)?;

    state.merge.validate(req.source_id, req.target_id).await?;

    Ok(Json(OkResponse {
        data: OkData { ok: true },
    }))
}

pub async fn list_merge_logs(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Query(q), _): WithRejection<Query<MergeLogQuery>, ApiError>,
) -> Result<Json<Vec<MergeLog>>, ApiError> {
    ensure_staff(&auth)?;

    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    if !(1..=MAX_LOG_LIMIT).contains(&limit) {
        return Err(MergeError::Validation(format!(
            "limit must be between 1 and {MAX_LOG_LIMIT}"
        ))
        .into());
    }

    let logs = state.merge.merge_logs(q.patient_id, limit).await?;

    Ok(Json(logs))
}

pub async fn get_merge_log(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Path(merge_log_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> Result<Json<MergeLog>, ApiError> {
    ensure_staff(&auth)?;

    let log = state
        .merge
        .merge_log(merge_log_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "merge log not found".to_string()))?;

    Ok(Json(log))
}

pub async fn get_canonical_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    WithRejection(Path(patient_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> Result<Json<CanonicalPatientResponse>, ApiError> {
    ensure_staff(&auth)?;

    let chain = state.merge.resolve_canonical(patient_id).await?;
    let canonical_patient_id = chain.last().copied().unwrap_or(patient_id);

    Ok(Json(CanonicalPatientResponse {
        data: CanonicalPatientData {
            requested_patient_id: patient_id,
            canonical_patient_id,
            chain,
        },
    }))
}
