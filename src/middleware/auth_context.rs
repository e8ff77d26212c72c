use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::AppState;

/// dcms_user.roles value of patient accounts.
const PATIENT_ROLE: i16 = 0;

/// The signed-in DCMS user behind a bearer token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: i16,
    pub session_token_id: Uuid,
}

impl AuthContext {
    pub fn is_staff(&self) -> bool {
        self.role != PATIENT_ROLE
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    roles: i16,
}

async fn lookup_session(db: &PgPool, token_hash: &str) -> Result<SessionLookupRow, ApiError> {
    sqlx::query_as::<_, SessionLookupRow>(
        r#"
        SELECT st.session_token_id, st.user_id, u.roles
        FROM session_token st
        JOIN "dcms_user" u ON u.user_id = st.user_id
        WHERE st.session_token_hash = $1
          AND st.revoked_at IS NULL
          AND st.expires_at > now()
          AND u.is_active = true
        "#,
    )
    .bind(token_hash)
    .fetch_optional(db)
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
    .ok_or_else(ApiError::session_expired)
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let row = lookup_session(&state.db, &hash_access_token(authz.token())).await?;

            if let Err(e) = sqlx::query(
                r#"
                UPDATE session_token
                SET last_seen_at = now()
                WHERE session_token_id = $1
                "#,
            )
            .bind(row.session_token_id)
            .execute(&state.db)
            .await
            {
                tracing::debug!(session_token_id = %row.session_token_id, "last_seen_at not updated: {e}");
            }

            Ok(AuthContext {
                user_id: row.user_id,
                role: row.roles,
                session_token_id: row.session_token_id,
            })
        }
    }
}
