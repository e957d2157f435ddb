use crate::domain::models::UserRole;
use crate::error::AppError;
use crate::state::SharedState;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap, HeaderValue},
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_TTL_MINUTES: i64 = 60;
pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone)]
pub struct SessionClaims {
    pub user_id: Uuid,
    pub role: UserRole,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid token format")]
    Invalid,
    #[error("signature mismatch")]
    Signature,
    #[error("expired")]
    Expired,
    #[error("bad role")]
    Role,
}

pub fn sign_session(
    user_id: Uuid,
    role: UserRole,
    key: &[u8],
    now: DateTime<Utc>,
) -> Result<String, SessionError> {
    let exp = now + Duration::minutes(SESSION_TTL_MINUTES);
    let payload = format!("{}|{}|{}", user_id, role.as_str(), exp.timestamp());
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SessionError::Invalid)?;
    mac.update(payload.as_bytes());
    let sig = mac.finalize().into_bytes();
    Ok(format!(
        "{}.{}",
        general_purpose::STANDARD.encode(payload.as_bytes()),
        general_purpose::STANDARD.encode(sig)
    ))
}

pub fn verify_session(
    token: &str,
    key: &[u8],
    now: DateTime<Utc>,
) -> Result<SessionClaims, SessionError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(SessionError::Invalid)?;
    let payload_bytes = general_purpose::STANDARD
        .decode(payload_b64)
        .map_err(|_| SessionError::Invalid)?;
    let sig_bytes = general_purpose::STANDARD
        .decode(sig_b64)
        .map_err(|_| SessionError::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SessionError::Invalid)?;
    mac.update(&payload_bytes);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| SessionError::Signature)?;

    let payload = String::from_utf8(payload_bytes).map_err(|_| SessionError::Invalid)?;
    let pieces: Vec<&str> = payload.split('|').collect();
    if pieces.len() != 3 {
        return Err(SessionError::Invalid);
    }
    let user_id = Uuid::parse_str(pieces[0]).map_err(|_| SessionError::Invalid)?;
    let role = UserRole::try_from(pieces[1]).map_err(|_| SessionError::Role)?;
    let exp: i64 = pieces[2].parse().map_err(|_| SessionError::Invalid)?;
    if now.timestamp() > exp {
        return Err(SessionError::Expired);
    }
    Ok(SessionClaims { user_id, role })
}

pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(val) = auth.to_str() {
            if let Some(bearer) = val.strip_prefix("Bearer ") {
                return Some(bearer.trim().to_string());
            }
        }
    }
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        pair.trim()
            .strip_prefix("session=")
            .map(|rest| rest.to_string())
    })
}

/// `Set-Cookie` value carrying the session token.
pub fn session_cookie(token: &str, secure: bool) -> Result<HeaderValue, AppError> {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{secure_flag}",
        SESSION_TTL_MINUTES * 60
    )
    .parse()
    .map_err(|_| AppError::Internal(anyhow::anyhow!("session cookie is not a valid header")))
}

// ============================================
// Axum extractor
// ============================================

/// Authenticated caller. Rejects with 401 when the token is missing, forged or expired.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl AuthUser {
    /// 403 unless the caller holds one of `roles`.
    pub fn require(&self, roles: &[UserRole]) -> Result<(), AppError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            tracing::warn!(
                "User {} with role {} denied access",
                self.user_id,
                self.role.as_str()
            );
            Err(AppError::Forbidden(
                "You do not have permission to perform this action.".to_string(),
            ))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    SharedState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let shared_state = SharedState::from_ref(state);

        let token = extract_token(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("Access token missing.".to_string()))?;

        let claims = verify_session(&token, &shared_state.session_key, Utc::now()).map_err(|e| {
            tracing::warn!("Session verification failed: {}", e);
            AppError::Unauthorized("Invalid or expired session.".to_string())
        })?;

        Ok(AuthUser {
            user_id: claims.user_id,
            role: claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn signed_token_verifies() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let token = sign_session(id, UserRole::Counselor, KEY, now).unwrap();
        let claims = verify_session(&token, KEY, now).unwrap();
        assert_eq!(claims.user_id, id);
        assert_eq!(claims.role, UserRole::Counselor);

        let at_expiry = now + Duration::minutes(SESSION_TTL_MINUTES);
        assert!(verify_session(&token, KEY, at_expiry).is_ok());
        assert!(matches!(
            verify_session(&token, KEY, at_expiry + Duration::seconds(1)),
            Err(SessionError::Expired)
        ));
    }

    #[test]
    fn tampered_or_expired_tokens_fail() {
        let now = Utc::now();
        let token = sign_session(Uuid::new_v4(), UserRole::Patient, KEY, now).unwrap();

        let other_key = b"fedcba9876543210fedcba9876543210";
        assert!(matches!(
            verify_session(&token, other_key, now),
            Err(SessionError::Signature)
        ));

        let later = now + Duration::minutes(SESSION_TTL_MINUTES + 1);
        assert!(matches!(
            verify_session(&token, KEY, later),
            Err(SessionError::Expired)
        ));

        assert!(matches!(
            verify_session("garbage", KEY, now),
            Err(SessionError::Invalid)
        ));
    }

    #[test]
    fn token_is_read_from_bearer_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "theme=dark; session=abc.def".parse().unwrap());
        assert_eq!(extract_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, "Bearer xyz.123".parse().unwrap());
        assert_eq!(extract_token(&headers).as_deref(), Some("xyz.123"));

        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn require_checks_role() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            role: UserRole::Graphologist,
        };
        assert!(user.require(&[UserRole::Graphologist, UserRole::Researcher]).is_ok());
        assert!(matches!(
            user.require(&[UserRole::Counselor]),
            Err(AppError::Forbidden(_))
        ));
    }
}
