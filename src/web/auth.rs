use crate::crypto::{self, PiiCipher};
use crate::db::{self, DbUser, NewUser, PendingRegistration};
use crate::domain::models::{UserProfile, UserRole};
use crate::error::{AppError, AppResult};
use crate::services::mailer::OutgoingMail;
use crate::state::SharedState;
use crate::web::session::{self, AuthUser};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const OTP_TTL_MINUTES: i64 = 5;
pub const RESET_TOKEN_TTL_MINUTES: i64 = 60;
const REGISTRATION_PURPOSE: &str = "registration";

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub phone: String,
    pub password: String,
    pub role: UserRole,
    pub name: Option<String>,
    pub dob: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct VerifyRegistrationRequest {
    pub email: String,
    pub otp: String,
}

#[derive(Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub dob: Option<NaiveDate>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub message: &'static str,
    pub token: String,
    pub user: UserProfile,
    pub is_first_login: bool,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/verify-registration", post(verify_registration))
        .route("/resend-otp", post(resend_otp))
        .route("/login", post(login))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password", post(reset_password))
        .route("/accept-disclaimer", post(accept_disclaimer))
        .route("/reset-disclaimer", post(reset_disclaimer))
        .route("/me", get(me))
        .route("/profile", post(update_profile))
        .with_state(state)
}

/// Emails are compared case-insensitively everywhere, including the rate limiter key.
pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("A valid email is required.".to_string()));
    }
    Ok(email)
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub(crate) fn to_profile(cipher: &PiiCipher, user: &DbUser) -> UserProfile {
    UserProfile {
        id: user.id,
        email: user.email.clone(),
        phone: cipher.open_opt(Some(&user.enc_phone)).unwrap_or_default(),
        role: user.role,
        name: cipher.open_opt(user.enc_name.as_deref()),
        dob: user.dob,
        registered_at: user.created_at,
        has_accepted_disclaimer: user.has_accepted_disclaimer,
    }
}

fn session_response(
    state: &SharedState,
    user: &DbUser,
    message: &'static str,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let token = session::sign_session(user.id, user.role, &state.session_key, Utc::now())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("session signing failed: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        session::session_cookie(&token, state.secure_cookies)?,
    );

    Ok((
        headers,
        Json(SessionResponse {
            message,
            token,
            user: to_profile(&state.cipher, user),
            is_first_login: !user.has_accepted_disclaimer,
        }),
    ))
}

async fn enforce_otp_limit(state: &SharedState, email: &str, what: &str) -> AppResult<()> {
    let decision = state.otp_limiter.check_request(email, Utc::now()).await?;
    if !decision.allowed {
        return Err(AppError::TooManyRequests(format!(
            "Too many {what}. Please try again in {} minutes.",
            decision.wait_minutes
        )));
    }
    Ok(())
}

async fn issue_registration_otp(
    state: &SharedState,
    email: &str,
    pending: Option<&PendingRegistration>,
) -> AppResult<()> {
    let code = crypto::generate_otp();
    let expires_at = Utc::now() + Duration::minutes(OTP_TTL_MINUTES);
    db::replace_otp(&state.pool, email, REGISTRATION_PURPOSE, &code, pending, expires_at).await?;

    state
        .mailer
        .send(OutgoingMail::verification_code(email, &code))
        .await
        .map_err(|e| {
            tracing::error!("Failed to send OTP email to {}: {:#}", email, e);
            AppError::Upstream("Failed to send OTP email.".to_string())
        })
}

async fn register(
    State(state): State<SharedState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    let email = normalize_email(&payload.email)?;
    if payload.phone.trim().is_empty() || payload.password.is_empty() {
        return Err(AppError::BadRequest("Missing required fields.".to_string()));
    }

    if db::find_user_by_email(&state.pool, &email).await?.is_some() {
        return Err(AppError::Conflict(
            "User with this email already exists.".to_string(),
        ));
    }

    enforce_otp_limit(&state, &email, "OTP requests").await?;

    let pending = PendingRegistration {
        enc_phone: state.cipher.seal(payload.phone.trim()).map_err(anyhow::Error::from)?,
        hash: crypto::hash_password(&payload.password)?,
        role: payload.role,
        enc_name: state
            .cipher
            .seal_opt(non_empty(payload.name.as_deref()))
            .map_err(anyhow::Error::from)?,
        dob: payload.dob,
    };
    issue_registration_otp(&state, &email, Some(&pending)).await?;

    tracing::info!("Registration OTP issued for {} ({})", email, payload.role.as_str());
    Ok(Json(json!({
        "message": "OTP sent to your email. Please verify to complete registration."
    })))
}

async fn verify_registration(
    State(state): State<SharedState>,
    Json(payload): Json<VerifyRegistrationRequest>,
) -> AppResult<impl IntoResponse> {
    let email = normalize_email(&payload.email)?;
    let record = db::find_live_otp(&state.pool, &email, REGISTRATION_PURPOSE, Utc::now())
        .await?
        .filter(|r| r.code == payload.otp.trim())
        .ok_or_else(|| AppError::BadRequest("Invalid or expired OTP.".to_string()))?;

    let pending = record.pending_registration.map(|p| p.0).ok_or_else(|| {
        AppError::BadRequest("Registration details expired. Please register again.".to_string())
    })?;

    if db::find_user_by_email(&state.pool, &email).await?.is_some() {
        return Err(AppError::Conflict(
            "User with this email already exists.".to_string(),
        ));
    }

    let user = db::insert_user(
        &state.pool,
        &NewUser {
            email: &email,
            enc_phone: &pending.enc_phone,
            hash: &pending.hash,
            role: pending.role,
            enc_name: pending.enc_name.as_deref(),
            dob: pending.dob,
            has_accepted_disclaimer: false,
            counselor_id: None,
        },
    )
    .await?;

    db::delete_otp(&state.pool, &email, REGISTRATION_PURPOSE).await?;
    state.otp_limiter.reset(&email).await?;

    tracing::info!("User {} registered as {}", user.id, user.role.as_str());
    let (headers, body) = session_response(&state, &user, "Registration successful!")?;
    Ok((StatusCode::CREATED, headers, body))
}

async fn resend_otp(
    State(state): State<SharedState>,
    Json(payload): Json<EmailRequest>,
) -> AppResult<impl IntoResponse> {
    let email = normalize_email(&payload.email)?;
    enforce_otp_limit(&state, &email, "OTP requests").await?;
    issue_registration_otp(&state, &email, None).await?;
    Ok(Json(json!({ "message": "New OTP sent to your email." })))
}

async fn login(
    State(state): State<SharedState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let email = normalize_email(&payload.email)?;
    let user = db::find_user_by_email(&state.pool, &email)
        .await?
        .filter(|u| crypto::verify_password(&payload.password, &u.hash))
        .ok_or_else(|| {
            tracing::warn!("Failed login for {}", email);
            AppError::Unauthorized("Invalid credentials.".to_string())
        })?;

    session_response(&state, &user, "Login successful!")
}

async fn forgot_password(
    State(state): State<SharedState>,
    Json(payload): Json<EmailRequest>,
) -> AppResult<impl IntoResponse> {
    let email = normalize_email(&payload.email)?;
    let user = db::find_user_by_email(&state.pool, &email)
        .await?
        .ok_or_else(|| AppError::NotFound("User with this email does not exist.".to_string()))?;

    enforce_otp_limit(&state, &email, "requests").await?;

    let token = crypto::generate_reset_token();
    let expires_at = Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES);
    db::insert_reset_token(&state.pool, user.id, &token, expires_at).await?;

    state
        .mailer
        .send(OutgoingMail::password_reset(&email, &state.frontend_url, &token))
        .await
        .map_err(|e| {
            tracing::error!("Failed to send reset email to {}: {:#}", email, e);
            AppError::Upstream("Failed to send reset password email.".to_string())
        })?;

    Ok(Json(json!({ "message": "Password reset link sent to your email." })))
}

async fn reset_password(
    State(state): State<SharedState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<impl IntoResponse> {
    if payload.token.trim().is_empty() || payload.new_password.is_empty() {
        return Err(AppError::BadRequest(
            "Token and new password are required.".to_string(),
        ));
    }

    let user_id = db::take_reset_token(&state.pool, payload.token.trim(), Utc::now())
        .await?
        .ok_or_else(|| AppError::BadRequest("Invalid or expired reset token.".to_string()))?;

    if db::find_user_by_id(&state.pool, user_id).await?.is_none() {
        return Err(AppError::NotFound("User not found.".to_string()));
    }

    let hash = crypto::hash_password(&payload.new_password)?;
    db::update_password(&state.pool, user_id, &hash).await?;

    tracing::info!("Password reset for user {}", user_id);
    Ok(Json(json!({ "message": "Password reset successfully." })))
}

async fn accept_disclaimer(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<impl IntoResponse> {
    if !db::set_disclaimer_accepted(&state.pool, auth.user_id, true).await? {
        return Err(AppError::NotFound("User not found.".to_string()));
    }
    Ok(Json(json!({ "message": "Disclaimer accepted successfully!" })))
}

async fn reset_disclaimer(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<impl IntoResponse> {
    if !db::set_disclaimer_accepted(&state.pool, auth.user_id, false).await? {
        return Err(AppError::NotFound("User not found.".to_string()));
    }
    Ok(Json(json!({
        "message": "Disclaimer reset successfully! User will see disclaimer on next login."
    })))
}

async fn me(State(state): State<SharedState>, auth: AuthUser) -> AppResult<impl IntoResponse> {
    let user = db::find_user_by_id(&state.pool, auth.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found.".to_string()))?;

    Ok(Json(json!({
        "user": to_profile(&state.cipher, &user),
        "is_first_login": !user.has_accepted_disclaimer,
    })))
}

async fn update_profile(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(payload): Json<ProfileUpdate>,
) -> AppResult<impl IntoResponse> {
    let enc_name = state
        .cipher
        .seal_opt(non_empty(payload.name.as_deref()))
        .map_err(anyhow::Error::from)?;
    let enc_phone = state
        .cipher
        .seal_opt(non_empty(payload.phone.as_deref()))
        .map_err(anyhow::Error::from)?;

    let user = db::update_profile(
        &state.pool,
        auth.user_id,
        enc_name.as_deref(),
        enc_phone.as_deref(),
        payload.dob,
    )
    .await?
    .ok_or_else(|| AppError::NotFound("User not found.".to_string()))?;

    Ok(Json(json!({
        "message": "Profile updated successfully!",
        "user": to_profile(&state.cipher, &user),
    })))
}
