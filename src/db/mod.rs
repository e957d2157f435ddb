pub mod gates;

use crate::domain::analysis::{DualAssessment, GraphPoint, ImageAnalysis, IndicatorScores};
use crate::domain::arrs::QuestionnaireResult;
use crate::domain::cooldown::{self, SubmissionDecision};
use crate::domain::models::{AiAgreement, SampleStatus, UserRole};
use crate::domain::statistics::{AnalysisFact, SampleFact};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct DbUser {
    pub id: Uuid,
    pub email: String,
    pub enc_phone: String,
    pub hash: String,
    pub role: UserRole,
    pub enc_name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub has_accepted_disclaimer: bool,
    pub created_at: DateTime<Utc>,
}

pub struct NewUser<'a> {
    pub email: &'a str,
    pub enc_phone: &'a str,
    pub hash: &'a str,
    pub role: UserRole,
    pub enc_name: Option<&'a str>,
    pub dob: Option<NaiveDate>,
    pub has_accepted_disclaimer: bool,
    pub counselor_id: Option<Uuid>,
}

/// Registration data held with the OTP until the code is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub enc_phone: String,
    pub hash: String,
    pub role: UserRole,
    pub enc_name: Option<String>,
    pub dob: Option<NaiveDate>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OtpRecord {
    pub code: String,
    pub pending_registration: Option<Json<PendingRegistration>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbSample {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub patient_pid: String,
    pub created_at: DateTime<Utc>,
    pub image_url: String,
    pub ai_prediction: String,
    pub confidence: f64,
    pub scores: Json<IndicatorScores>,
    pub features: Option<Json<BTreeMap<String, String>>>,
    pub status: SampleStatus,
    pub consented_for_research: bool,
    pub review_word_spacing: Option<String>,
    pub review_pressure: Option<String>,
    pub review_qualitative: Option<String>,
    pub review_ai_agreement: Option<String>,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

pub struct NewSample<'a> {
    pub patient_id: Uuid,
    pub patient_pid: &'a str,
    pub image_url: &'a str,
    pub analysis: &'a ImageAnalysis,
}

#[derive(Debug)]
pub enum SampleInsert {
    Inserted(DbSample),
    CooldownActive(SubmissionDecision),
}

pub struct SampleReview<'a> {
    pub word_spacing: &'a str,
    pub pressure: &'a str,
    pub qualitative_analysis: &'a str,
    pub ai_agreement: AiAgreement,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbAnalysis {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub sample_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub image_analysis: Json<ImageAnalysis>,
    pub questionnaire_analysis: Json<QuestionnaireResult>,
    pub combined_outcome: String,
    pub graph_data: Json<Vec<GraphPoint>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ResearchAnalysisRow {
    #[sqlx(flatten)]
    pub analysis: DbAnalysis,
    pub patient_dob: Option<NaiveDate>,
    pub patient_role: Option<UserRole>,
}

const USER_COLUMNS: &str = r#"
    id, email, enc_phone, hash, role, enc_name, dob,
    has_accepted_disclaimer, created_at
"#;

const SAMPLE_COLUMNS: &str = r#"
    id, patient_id, patient_pid, created_at, image_url, ai_prediction, confidence,
    scores, features, status, consented_for_research, review_word_spacing,
    review_pressure, review_qualitative, review_ai_agreement, reviewed_by, reviewed_at
"#;

const ANALYSIS_COLUMNS: &str = r#"
    a.id, a.patient_id, a.sample_id, a.created_at, a.image_analysis,
    a.questionnaire_analysis, a.combined_outcome, a.graph_data
"#;

// ============================================
// Users
// ============================================

pub async fn find_user_by_email(pool: &PgPool, email: &str) -> Result<Option<DbUser>> {
    let user = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<DbUser>> {
    let user = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn insert_user(pool: &PgPool, user: &NewUser<'_>) -> Result<DbUser> {
    let created = sqlx::query_as::<_, DbUser>(&format!(
        r#"
        INSERT INTO users
            (id, email, enc_phone, hash, role, enc_name, dob,
             has_accepted_disclaimer, counselor_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user.email)
    .bind(user.enc_phone)
    .bind(user.hash)
    .bind(user.role)
    .bind(user.enc_name)
    .bind(user.dob)
    .bind(user.has_accepted_disclaimer)
    .bind(user.counselor_id)
    .fetch_one(pool)
    .await?;
    Ok(created)
}

pub async fn update_password(pool: &PgPool, user_id: Uuid, hash: &str) -> Result<()> {
    sqlx::query("UPDATE users SET hash = $2 WHERE id = $1")
        .bind(user_id)
        .bind(hash)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_disclaimer_accepted(pool: &PgPool, user_id: Uuid, accepted: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE users SET has_accepted_disclaimer = $2 WHERE id = $1")
        .bind(user_id)
        .bind(accepted)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Partial update; `None` keeps the stored value.
pub async fn update_profile(
    pool: &PgPool,
    user_id: Uuid,
    enc_name: Option<&str>,
    enc_phone: Option<&str>,
    dob: Option<NaiveDate>,
) -> Result<Option<DbUser>> {
    let user = sqlx::query_as::<_, DbUser>(&format!(
        r#"
        UPDATE users SET
            enc_name = COALESCE($2, enc_name),
            enc_phone = COALESCE($3, enc_phone),
            dob = COALESCE($4, dob)
        WHERE id = $1
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(enc_name)
    .bind(enc_phone)
    .bind(dob)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn patients_for_counselor(pool: &PgPool, counselor_id: Uuid) -> Result<Vec<DbUser>> {
    let users = sqlx::query_as::<_, DbUser>(&format!(
        r#"
        SELECT {USER_COLUMNS} FROM users
        WHERE counselor_id = $1 AND role = 'Patient'
        ORDER BY created_at DESC
        "#
    ))
    .bind(counselor_id)
    .fetch_all(pool)
    .await?;
    Ok(users)
}

pub async fn is_patient_of(pool: &PgPool, patient_id: Uuid, counselor_id: Uuid) -> Result<bool> {
    let owned: Option<bool> = sqlx::query_scalar(
        "SELECT TRUE FROM users WHERE id = $1 AND counselor_id = $2 AND role = 'Patient'",
    )
    .bind(patient_id)
    .bind(counselor_id)
    .fetch_optional(pool)
    .await?;
    Ok(owned.unwrap_or(false))
}

// ============================================
// OTP codes and reset tokens
// ============================================

pub async fn replace_otp(
    pool: &PgPool,
    email: &str,
    purpose: &str,
    code: &str,
    pending: Option<&PendingRegistration>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO otp_codes (email, purpose, code, pending_registration, created_at, expires_at)
        VALUES ($1, $2, $3, $4, NOW(), $5)
        ON CONFLICT (email, purpose) DO UPDATE SET
            code = EXCLUDED.code,
            pending_registration = COALESCE(EXCLUDED.pending_registration, otp_codes.pending_registration),
            created_at = EXCLUDED.created_at,
            expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(email)
    .bind(purpose)
    .bind(code)
    .bind(pending.map(Json))
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_live_otp(
    pool: &PgPool,
    email: &str,
    purpose: &str,
    now: DateTime<Utc>,
) -> Result<Option<OtpRecord>> {
    let record = sqlx::query_as::<_, OtpRecord>(
        r#"
        SELECT code, pending_registration
        FROM otp_codes
        WHERE email = $1 AND purpose = $2 AND expires_at > $3
        "#,
    )
    .bind(email)
    .bind(purpose)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn delete_otp(pool: &PgPool, email: &str, purpose: &str) -> Result<()> {
    sqlx::query("DELETE FROM otp_codes WHERE email = $1 AND purpose = $2")
        .bind(email)
        .bind(purpose)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_reset_token(
    pool: &PgPool,
    user_id: Uuid,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO reset_tokens (token, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;
    Ok(())
}

/// Single use: the token row is removed whether or not it was still valid.
pub async fn take_reset_token(pool: &PgPool, token: &str, now: DateTime<Utc>) -> Result<Option<Uuid>> {
    let row: Option<(Uuid, DateTime<Utc>)> =
        sqlx::query_as("DELETE FROM reset_tokens WHERE token = $1 RETURNING user_id, expires_at")
            .bind(token)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(user_id, expires_at)| (expires_at > now).then_some(user_id)))
}

pub async fn purge_expired_codes(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let otp = sqlx::query("DELETE FROM otp_codes WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    let tokens = sqlx::query("DELETE FROM reset_tokens WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(otp + tokens)
}

// ============================================
// Handwriting samples
// ============================================

pub async fn last_sample_at(pool: &PgPool, patient_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let last: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(created_at) FROM handwriting_samples WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_one(pool)
            .await?;
    Ok(last)
}

/// Authoritative cooldown check: the patient row is locked so two uploads cannot both pass.
pub async fn insert_sample_if_eligible(
    pool: &PgPool,
    sample: &NewSample<'_>,
    now: DateTime<Utc>,
) -> Result<SampleInsert> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(sample.patient_id)
        .execute(&mut *tx)
        .await?;

    let last: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(created_at) FROM handwriting_samples WHERE patient_id = $1")
            .bind(sample.patient_id)
            .fetch_one(&mut *tx)
            .await?;

    let decision = cooldown::evaluate(last, now);
    if !decision.allowed {
        tx.rollback().await?;
        return Ok(SampleInsert::CooldownActive(decision));
    }

    let inserted = sqlx::query_as::<_, DbSample>(&format!(
        r#"
        INSERT INTO handwriting_samples
            (id, patient_id, patient_pid, created_at, image_url, ai_prediction,
             confidence, scores, features)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {SAMPLE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(sample.patient_id)
    .bind(sample.patient_pid)
    .bind(now)
    .bind(sample.image_url)
    .bind(sample.analysis.outcome.as_str())
    .bind(sample.analysis.confidence)
    .bind(Json(sample.analysis.scores))
    .bind(Json(&sample.analysis.features))
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(SampleInsert::Inserted(inserted))
}

pub async fn find_sample(pool: &PgPool, id: Uuid) -> Result<Option<DbSample>> {
    let sample = sqlx::query_as::<_, DbSample>(&format!(
        "SELECT {SAMPLE_COLUMNS} FROM handwriting_samples WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(sample)
}

pub async fn set_sample_consent(pool: &PgPool, id: Uuid, consent: bool) -> Result<()> {
    sqlx::query("UPDATE handwriting_samples SET consented_for_research = $2 WHERE id = $1")
        .bind(id)
        .bind(consent)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn pending_research_samples(pool: &PgPool) -> Result<Vec<DbSample>> {
    let samples = sqlx::query_as::<_, DbSample>(&format!(
        r#"
        SELECT {SAMPLE_COLUMNS} FROM handwriting_samples
        WHERE status = 'pending' AND consented_for_research
        ORDER BY created_at ASC
        "#
    ))
    .fetch_all(pool)
    .await?;
    Ok(samples)
}

pub async fn submit_review(
    pool: &PgPool,
    sample_id: Uuid,
    reviewer: Uuid,
    review: &SampleReview<'_>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE handwriting_samples SET
            status = 'reviewed',
            review_word_spacing = $2,
            review_pressure = $3,
            review_qualitative = $4,
            review_ai_agreement = $5,
            reviewed_by = $6,
            reviewed_at = $7
        WHERE id = $1
        "#,
    )
    .bind(sample_id)
    .bind(review.word_spacing)
    .bind(review.pressure)
    .bind(review.qualitative_analysis)
    .bind(review.ai_agreement.as_str())
    .bind(reviewer)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn reviews_by(pool: &PgPool, reviewer: Uuid) -> Result<Vec<DbSample>> {
    let samples = sqlx::query_as::<_, DbSample>(&format!(
        r#"
        SELECT {SAMPLE_COLUMNS} FROM handwriting_samples
        WHERE reviewed_by = $1
        ORDER BY reviewed_at DESC
        "#
    ))
    .bind(reviewer)
    .fetch_all(pool)
    .await?;
    Ok(samples)
}

pub async fn sample_facts(pool: &PgPool) -> Result<Vec<SampleFact>> {
    #[derive(FromRow)]
    struct Row {
        ai_prediction: String,
        review_ai_agreement: Option<String>,
        features: Option<Json<BTreeMap<String, String>>>,
    }

    let rows = sqlx::query_as::<_, Row>(
        "SELECT ai_prediction, review_ai_agreement, features FROM handwriting_samples",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| SampleFact {
            ai_prediction: row.ai_prediction,
            ai_agreement: match row.review_ai_agreement.as_deref() {
                Some("Agree") => Some(AiAgreement::Agree),
                Some("Disagree") => Some(AiAgreement::Disagree),
                _ => None,
            },
            features: row.features.map(|f| f.0),
        })
        .collect())
}

// ============================================
// Analysis results
// ============================================

pub async fn insert_analysis(
    pool: &PgPool,
    patient_id: Uuid,
    sample_id: Uuid,
    assessment: &DualAssessment,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO analysis_results
            (id, patient_id, sample_id, created_at, image_analysis,
             questionnaire_analysis, combined_outcome, graph_data)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(patient_id)
    .bind(sample_id)
    .bind(now)
    .bind(Json(&assessment.image_analysis))
    .bind(Json(&assessment.questionnaire_analysis))
    .bind(&assessment.combined_outcome)
    .bind(Json(&assessment.graph_data))
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn analyses_for_patient(pool: &PgPool, patient_id: Uuid) -> Result<Vec<DbAnalysis>> {
    let rows = sqlx::query_as::<_, DbAnalysis>(&format!(
        r#"
        SELECT {ANALYSIS_COLUMNS} FROM analysis_results a
        WHERE a.patient_id = $1
        ORDER BY a.created_at DESC
        "#
    ))
    .bind(patient_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn analyses_for_counselor(pool: &PgPool, counselor_id: Uuid) -> Result<Vec<DbAnalysis>> {
    let rows = sqlx::query_as::<_, DbAnalysis>(&format!(
        r#"
        SELECT {ANALYSIS_COLUMNS} FROM analysis_results a
        JOIN users u ON u.id = a.patient_id
        WHERE u.counselor_id = $1
        ORDER BY a.created_at DESC
        "#
    ))
    .bind(counselor_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_patients_for_counselor(pool: &PgPool, counselor_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM users WHERE counselor_id = $1 AND role = 'Patient'",
    )
    .bind(counselor_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn research_analyses(pool: &PgPool) -> Result<Vec<ResearchAnalysisRow>> {
    let rows = sqlx::query_as::<_, ResearchAnalysisRow>(&format!(
        r#"
        SELECT {ANALYSIS_COLUMNS}, u.dob AS patient_dob, u.role AS patient_role
        FROM analysis_results a
        LEFT JOIN users u ON u.id = a.patient_id
        ORDER BY a.created_at DESC
        "#
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn analysis_facts(pool: &PgPool) -> Result<Vec<AnalysisFact>> {
    let rows: Vec<(String, Option<NaiveDate>)> = sqlx::query_as(
        r#"
        SELECT a.combined_outcome, u.dob
        FROM analysis_results a
        LEFT JOIN users u ON u.id = a.patient_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(combined_outcome, patient_dob)| AnalysisFact {
            combined_outcome,
            patient_dob,
        })
        .collect())
}
