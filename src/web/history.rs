use crate::db::{self, DbAnalysis};
use crate::domain::models::UserRole;
use crate::error::{AppError, AppResult};
use crate::state::SharedState;
use crate::web::session::AuthUser;
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/:user_id", get(history))
        .with_state(state)
}

/// Patients read their own history, counselors their own patients', reviewers anyone's.
async fn history(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<DbAnalysis>>> {
    match auth.role {
        UserRole::Patient if auth.user_id != user_id => {
            return Err(AppError::Forbidden("Unauthorized access.".to_string()));
        }
        UserRole::Counselor => {
            if !db::is_patient_of(&state.pool, user_id, auth.user_id).await? {
                return Err(AppError::Forbidden(
                    "Unauthorized access to this patient.".to_string(),
                ));
            }
        }
        _ => {}
    }

    let analyses = db::analyses_for_patient(&state.pool, user_id).await?;
    Ok(Json(analyses))
}
