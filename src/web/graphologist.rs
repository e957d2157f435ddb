use crate::db::{self, DbSample, SampleReview};
use crate::domain::models::{AiAgreement, UserRole};
use crate::error::{AppError, AppResult};
use crate::state::SharedState;
use crate::web::session::AuthUser;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub word_spacing: String,
    pub pressure: String,
    pub qualitative_analysis: String,
    pub ai_agreement: AiAgreement,
}

/// Review-queue entry; the classifier's raw scores and features stay out of the reviewer's view.
#[derive(Serialize)]
pub struct PendingSample {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub patient_pid: String,
    pub created_at: DateTime<Utc>,
    pub ai_prediction: String,
    pub confidence: f64,
    pub image_url: String,
}

impl From<DbSample> for PendingSample {
    fn from(sample: DbSample) -> Self {
        Self {
            id: sample.id,
            patient_id: sample.patient_id,
            patient_pid: sample.patient_pid,
            created_at: sample.created_at,
            ai_prediction: sample.ai_prediction,
            confidence: sample.confidence,
            image_url: sample.image_url,
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/samples/pending", get(pending_samples))
        .route("/samples/:id/review", post(submit_review))
        .route("/reviews", get(my_reviews))
        .with_state(state)
}

async fn pending_samples(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<PendingSample>>> {
    auth.require(&[UserRole::Graphologist])?;
    let samples = db::pending_research_samples(&state.pool).await?;
    Ok(Json(samples.into_iter().map(PendingSample::from).collect()))
}

async fn submit_review(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(sample_id): Path<Uuid>,
    Json(payload): Json<ReviewRequest>,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Graphologist])?;

    let review = SampleReview {
        word_spacing: payload.word_spacing.trim(),
        pressure: payload.pressure.trim(),
        qualitative_analysis: payload.qualitative_analysis.trim(),
        ai_agreement: payload.ai_agreement,
    };
    if !db::submit_review(&state.pool, sample_id, auth.user_id, &review, Utc::now()).await? {
        return Err(AppError::NotFound("Sample not found.".to_string()));
    }

    tracing::info!(
        "Sample {} reviewed by {} ({})",
        sample_id,
        auth.user_id,
        payload.ai_agreement.as_str()
    );
    Ok(Json(json!({ "message": "Review submitted successfully!" })))
}

async fn my_reviews(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<DbSample>>> {
    auth.require(&[UserRole::Graphologist])?;
    Ok(Json(db::reviews_by(&state.pool, auth.user_id).await?))
}
