use crate::crypto;
use crate::db::gates::SampleLedger;
use crate::db::{self, DbAnalysis, NewSample, NewUser, SampleInsert};
use crate::domain::analysis::{DualAssessment, ImageAnalysis, ImageVerdict};
use crate::domain::arrs::{self, Answers};
use crate::domain::cooldown::SubmissionDecision;
use crate::domain::models::{patient_pid, PatientSummary, UserRole};
use crate::domain::statistics::OutcomeTally;
use crate::error::{AppError, AppResult};
use crate::services::image_store::ImageStore;
use crate::state::SharedState;
use crate::web::auth::{non_empty, normalize_email};
use crate::web::session::AuthUser;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Deserialize)]
pub struct NewPatientRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: String,
    pub dob: NaiveDate,
}

#[derive(Deserialize)]
pub struct ConsentRequest {
    pub consent: bool,
}

#[derive(Deserialize)]
pub struct SaveAnalysisRequest {
    pub patient_id: Uuid,
    pub sample_id: Uuid,
    pub answers: Answers,
}

#[derive(Serialize)]
pub struct CounselorAnalysis {
    #[serde(flatten)]
    pub analysis: DbAnalysis,
    pub patient_pid: String,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/patients", get(list_patients).post(create_patient))
        .route("/patients/:id/submission-status", get(submission_status))
        .route(
            "/patients/:id/samples",
            post(upload_sample).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024)),
        )
        .route("/samples/:id/consent", post(set_consent))
        .route("/analyses", get(list_analyses).post(save_analysis))
        .route("/summary", get(summary))
        .with_state(state)
}

async fn ensure_own_patient(state: &SharedState, counselor: &AuthUser, patient_id: Uuid) -> AppResult<()> {
    if db::is_patient_of(&state.pool, patient_id, counselor.user_id).await? {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Unauthorized access to this patient.".to_string(),
        ))
    }
}

fn cooldown_response(decision: &SubmissionDecision) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "message": decision.wait_message(),
            "last_submission_at": decision.last_submission_at,
            "next_eligible_at": decision.next_eligible_at,
        })),
    )
        .into_response()
}

/// Content type from the file signature; only JPEG and PNG are accepted.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else {
        None
    }
}

async fn create_patient(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(payload): Json<NewPatientRequest>,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Counselor])?;
    let email = normalize_email(&payload.email)?;
    let (Some(name), Some(phone)) = (
        non_empty(Some(&payload.name)),
        non_empty(Some(&payload.phone)),
    ) else {
        return Err(AppError::BadRequest("Missing required fields.".to_string()));
    };
    if payload.password.is_empty() {
        return Err(AppError::BadRequest("Missing required fields.".to_string()));
    }

    if db::find_user_by_email(&state.pool, &email).await?.is_some() {
        return Err(AppError::Conflict(
            "A user with this email already exists.".to_string(),
        ));
    }

    let enc_phone = state.cipher.seal(phone).map_err(anyhow::Error::from)?;
    let enc_name = state.cipher.seal(name).map_err(anyhow::Error::from)?;
    let hash = crypto::hash_password(&payload.password)?;

    let patient = db::insert_user(
        &state.pool,
        &NewUser {
            email: &email,
            enc_phone: &enc_phone,
            hash: &hash,
            role: UserRole::Patient,
            enc_name: Some(&enc_name),
            dob: Some(payload.dob),
            has_accepted_disclaimer: true,
            counselor_id: Some(auth.user_id),
        },
    )
    .await?;

    tracing::info!("Counselor {} registered patient {}", auth.user_id, patient.id);
    let summary = PatientSummary {
        id: patient.id,
        pid: patient_pid(patient.id),
        email: patient.email,
        phone: phone.to_string(),
        name: Some(name.to_string()),
        dob: patient.dob,
        registered_at: patient.created_at,
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Patient registered successfully.",
            "patient": summary,
        })),
    ))
}

async fn list_patients(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<PatientSummary>>> {
    auth.require(&[UserRole::Counselor])?;
    let patients = db::patients_for_counselor(&state.pool, auth.user_id).await?;

    Ok(Json(
        patients
            .into_iter()
            .map(|p| PatientSummary {
                id: p.id,
                pid: patient_pid(p.id),
                phone: state.cipher.open_opt(Some(&p.enc_phone)).unwrap_or_default(),
                name: state.cipher.open_opt(p.enc_name.as_deref()),
                email: p.email,
                dob: p.dob,
                registered_at: p.created_at,
            })
            .collect(),
    ))
}

async fn submission_status(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(patient_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Counselor])?;
    ensure_own_patient(&state, &auth, patient_id).await?;

    let decision = state
        .sample_cooldown
        .can_submit(patient_id, Utc::now())
        .await?;

    Ok(Json(json!({
        "can_submit": decision.allowed,
        "last_submission_at": decision.last_submission_at,
        "next_eligible_at": decision.next_eligible_at,
        "message": decision.wait_message(),
    })))
}

async fn upload_sample(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(patient_id): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    auth.require(&[UserRole::Counselor])?;
    ensure_own_patient(&state, &auth, patient_id).await?;

    // Advisory check before spending a classifier call; the insert re-checks under lock.
    let advisory = state
        .sample_cooldown
        .can_submit(patient_id, Utc::now())
        .await?;
    if !advisory.allowed {
        tracing::warn!("Upload refused for patient {}: cooldown active", patient_id);
        return Ok(cooldown_response(&advisory));
    }

    let mut upload: Option<(Vec<u8>, String)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge("Image must be 5 MB or smaller.".to_string())
        } else {
            AppError::BadRequest(format!("Invalid upload: {e}"))
        }
    })? {
        if field.name() != Some("image") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("sample").to_string();
        let bytes = field.bytes().await.map_err(|e| {
            if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::PayloadTooLarge("Image must be 5 MB or smaller.".to_string())
            } else {
                AppError::BadRequest(format!("Invalid upload: {e}"))
            }
        })?;
        upload = Some((bytes.to_vec(), file_name));
    }

    let (image, file_name) =
        upload.ok_or_else(|| AppError::BadRequest("An image file is required.".to_string()))?;
    if image.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::PayloadTooLarge(
            "Image must be 5 MB or smaller.".to_string(),
        ));
    }
    let mime = sniff_image(&image).ok_or_else(|| {
        AppError::BadRequest("Only JPEG and PNG images are allowed.".to_string())
    })?;

    let analysis = state
        .classifier
        .classify(image.clone(), &file_name, mime)
        .await
        .map_err(|e| {
            tracing::error!("Classifier call failed for patient {}: {}", patient_id, e);
            AppError::Upstream(format!("Failed to analyze image. Reason: {e}"))
        })?;

    let inserted = persist_sample(
        state.samples.as_ref(),
        state.image_store.as_ref(),
        patient_id,
        SampleImage {
            bytes: image,
            file_name: &file_name,
            mime,
        },
        &analysis,
        Utc::now(),
    )
    .await?;

    let sample = match inserted {
        SampleInsert::Inserted(sample) => sample,
        SampleInsert::CooldownActive(decision) => {
            tracing::warn!(
                "Upload refused for patient {}: concurrent sample won the cooldown",
                patient_id
            );
            return Ok(cooldown_response(&decision));
        }
    };

    tracing::info!(
        "Sample {} stored for patient {} ({})",
        sample.id,
        patient_id,
        analysis.outcome.as_str()
    );
    Ok(Json(json!({
        "message": "Sample uploaded and analyzed successfully!",
        "sample_id": sample.id,
        "ai_prediction": analysis.outcome,
        "confidence": analysis.confidence,
        "scores": analysis.scores,
        "features": analysis.features,
    }))
    .into_response())
}

pub struct SampleImage<'a> {
    pub bytes: Vec<u8>,
    pub file_name: &'a str,
    pub mime: &'a str,
}

/// Stores the image, then inserts the sample under the cooldown lock.
/// The stored image is removed again if the insert is refused or fails.
pub async fn persist_sample(
    ledger: &dyn SampleLedger,
    images: &dyn ImageStore,
    patient_id: Uuid,
    image: SampleImage<'_>,
    analysis: &ImageAnalysis,
    now: DateTime<Utc>,
) -> AppResult<SampleInsert> {
    let stored = images
        .store(image.bytes, image.file_name, image.mime)
        .await
        .map_err(|e| {
            tracing::error!("Image upload failed for patient {}: {:#}", patient_id, e);
            AppError::Upstream(format!("Failed to save image. Reason: {e}"))
        })?;

    let pid = patient_pid(patient_id);
    let sample = NewSample {
        patient_id,
        patient_pid: &pid,
        image_url: &stored.url,
        analysis,
    };
    let result = ledger.insert_if_eligible(&sample, now).await;
    if !matches!(result, Ok(SampleInsert::Inserted(_))) {
        if let Err(e) = images.remove(&stored.public_id).await {
            tracing::error!("Failed to remove orphaned image {}: {:#}", stored.public_id, e);
        }
    }
    result.map_err(AppError::from)
}

async fn set_consent(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(sample_id): Path<Uuid>,
    Json(payload): Json<ConsentRequest>,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Counselor])?;
    let sample = db::find_sample(&state.pool, sample_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Sample not found.".to_string()))?;
    ensure_own_patient(&state, &auth, sample.patient_id).await?;

    db::set_sample_consent(&state.pool, sample_id, payload.consent).await?;
    Ok(Json(json!({ "message": "Consent updated successfully." })))
}

async fn save_analysis(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(payload): Json<SaveAnalysisRequest>,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Counselor])?;
    ensure_own_patient(&state, &auth, payload.patient_id).await?;

    let sample = db::find_sample(&state.pool, payload.sample_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Sample not found.".to_string()))?;
    if sample.patient_id != payload.patient_id {
        return Err(AppError::BadRequest(
            "Sample does not belong to this patient.".to_string(),
        ));
    }

    let questionnaire = arrs::score(&payload.answers)?;
    let image_analysis = ImageAnalysis {
        outcome: ImageVerdict::parse(&sample.ai_prediction),
        confidence: sample.confidence,
        scores: sample.scores.0,
        features: sample.features.map(|f| f.0).unwrap_or_default(),
    };
    let assessment = DualAssessment::combine(image_analysis, questionnaire);

    let analysis_id = db::insert_analysis(
        &state.pool,
        payload.patient_id,
        sample.id,
        &assessment,
        Utc::now(),
    )
    .await?;

    tracing::info!(
        "Analysis {} saved for patient {}: image {}, questionnaire {} ({})",
        analysis_id,
        payload.patient_id,
        assessment.image_analysis.outcome.as_str(),
        assessment.questionnaire_analysis.outcome.as_str(),
        assessment.questionnaire_analysis.score
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Analysis saved successfully!",
            "analysis_id": analysis_id,
            "signals_agree": assessment.signals_agree(),
            "analysis": assessment,
        })),
    ))
}

async fn list_analyses(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<CounselorAnalysis>>> {
    auth.require(&[UserRole::Counselor])?;
    let analyses = db::analyses_for_counselor(&state.pool, auth.user_id).await?;
    Ok(Json(
        analyses
            .into_iter()
            .map(|analysis| CounselorAnalysis {
                patient_pid: patient_pid(analysis.patient_id),
                analysis,
            })
            .collect(),
    ))
}

async fn summary(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Counselor])?;
    let total_patients = db::count_patients_for_counselor(&state.pool, auth.user_id).await?;
    let analyses = db::analyses_for_counselor(&state.pool, auth.user_id).await?;
    let tally = OutcomeTally::from_outcomes(analyses.iter().map(|a| a.combined_outcome.as_str()));

    Ok(Json(json!({
        "total_patients": total_patients,
        "total_analyses": tally.total,
        "recovery_count": tally.recovery,
        "relapse_count": tally.relapse,
        "recovery_rate": tally.recovery_rate(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::gates::InMemorySampleLedger;
    use crate::domain::analysis::IndicatorScores;
    use crate::domain::cooldown::{InMemorySubmissionHistory, SampleCooldown};
    use crate::services::image_store::StoredImage;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingImageStore {
        stored: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageStore for RecordingImageStore {
        async fn store(&self, _image: Vec<u8>, file_name: &str, _mime: &str) -> anyhow::Result<StoredImage> {
            let public_id = format!("handwriting-samples/{file_name}");
            self.stored.lock().unwrap().push(public_id.clone());
            Ok(StoredImage {
                url: format!("https://cdn.example.com/{public_id}"),
                public_id,
            })
        }

        async fn remove(&self, public_id: &str) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(public_id.to_string());
            Ok(())
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl SampleLedger for BrokenLedger {
        async fn insert_if_eligible(&self, _sample: &NewSample<'_>, _now: DateTime<Utc>) -> anyhow::Result<SampleInsert> {
            Err(anyhow::anyhow!("connection reset"))
        }
    }

    fn png() -> SampleImage<'static> {
        SampleImage {
            bytes: vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A],
            file_name: "page.png",
            mime: "image/png",
        }
    }

    fn verdict() -> ImageAnalysis {
        ImageAnalysis {
            outcome: ImageVerdict::Recovery,
            confidence: 80.0,
            scores: IndicatorScores {
                relapse: 2.0,
                recovery: 8.0,
            },
            features: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_recheck_refuses_when_another_upload_wins() {
        let history = InMemorySubmissionHistory::new();
        let cooldown = SampleCooldown::new(Arc::new(history.clone()));
        let ledger = InMemorySampleLedger {
            history: history.clone(),
        };
        let images = RecordingImageStore::default();
        let patient_id = Uuid::new_v4();
        let now = Utc::now();

        assert!(cooldown.can_submit(patient_id, now).await.unwrap().allowed);
        // A concurrent upload lands between the advisory read and the insert.
        history.record(patient_id, now - Duration::seconds(5)).await;

        let outcome = persist_sample(&ledger, &images, patient_id, png(), &verdict(), now)
            .await
            .unwrap();
        let decision = match outcome {
            SampleInsert::CooldownActive(decision) => decision,
            SampleInsert::Inserted(_) => panic!("insert should have been refused"),
        };
        assert!(!decision.allowed);
        assert_eq!(cooldown_response(&decision).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            *images.removed.lock().unwrap(),
            vec!["handwriting-samples/page.png".to_string()]
        );
    }

    #[tokio::test]
    async fn accepted_sample_keeps_its_image() {
        let ledger = InMemorySampleLedger::default();
        let images = RecordingImageStore::default();
        let patient_id = Uuid::new_v4();

        let outcome = persist_sample(&ledger, &images, patient_id, png(), &verdict(), Utc::now())
            .await
            .unwrap();
        match outcome {
            SampleInsert::Inserted(sample) => {
                assert_eq!(sample.patient_id, patient_id);
                assert_eq!(sample.image_url, "https://cdn.example.com/handwriting-samples/page.png");
                assert_eq!(sample.patient_pid, patient_pid(patient_id));
            }
            SampleInsert::CooldownActive(_) => panic!("first sample should be accepted"),
        }
        assert!(images.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_insert_removes_the_stored_image() {
        let images = RecordingImageStore::default();
        let err = persist_sample(&BrokenLedger, &images, Uuid::new_v4(), png(), &verdict(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(images.stored.lock().unwrap().len(), 1);
        assert_eq!(images.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn only_jpeg_and_png_signatures_pass() {
        assert_eq!(sniff_image(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), Some("image/jpeg"));
        assert_eq!(
            sniff_image(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00]),
            Some("image/png")
        );
        assert_eq!(sniff_image(b"GIF89a"), None);
        assert_eq!(sniff_image(&[]), None);
    }

    #[test]
    fn cooldown_response_is_forbidden_with_dates() {
        let last = Utc::now();
        let decision = crate::domain::cooldown::evaluate(Some(last), last);
        let response = cooldown_response(&decision);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn analysis_payload_accepts_string_question_keys() {
        let mut answers = serde_json::Map::new();
        for id in 1..=27 {
            answers.insert(id.to_string(), json!(2));
        }
        let body = json!({
            "patient_id": Uuid::new_v4(),
            "sample_id": Uuid::new_v4(),
            "answers": answers,
        });
        let payload: SaveAnalysisRequest = serde_json::from_value(body).unwrap();
        assert_eq!(payload.answers.len(), 27);
        assert!(arrs::score(&payload.answers).is_ok());
    }
}
