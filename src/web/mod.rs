pub mod auth;
pub mod counselor;
pub mod graphologist;
pub mod history;
pub mod researcher;
pub mod session;

use crate::state::SharedState;
use axum::{routing::get, Router};

async fn health() -> &'static str {
    "OK"
}

pub fn routes(state: SharedState) -> Router {
    let api = Router::new()
        .nest("/auth", auth::router(state.clone()))
        .nest("/counselor", counselor::router(state.clone()))
        .nest("/history", history::router(state.clone()))
        .nest("/graphologist", graphologist::router(state.clone()))
        .nest("/researcher", researcher::router(state));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PiiCipher;
    use crate::db::gates::InMemorySampleLedger;
    use crate::domain::cooldown::{InMemorySubmissionHistory, SampleCooldown};
    use crate::domain::models::UserRole;
    use crate::middleware::rate_limit::{InMemoryRequestWindows, OtpRateLimiter};
    use crate::services::classifier::HttpClassifier;
    use crate::services::image_store::UnconfiguredImageStore;
    use crate::services::mailer::LogMailer;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::Utc;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn test_state() -> SharedState {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/handwriting_test")
            .unwrap();
        Arc::new(AppState {
            pool,
            cipher: Arc::new(PiiCipher::from_key_bytes(&[1u8; 32]).unwrap()),
            session_key: KEY.to_vec(),
            classifier: Arc::new(HttpClassifier::new("http://127.0.0.1:9/analyze".to_string()).unwrap()),
            image_store: Arc::new(UnconfiguredImageStore),
            mailer: Arc::new(LogMailer),
            otp_limiter: OtpRateLimiter::new(Arc::new(InMemoryRequestWindows::new())),
            sample_cooldown: SampleCooldown::new(Arc::new(InMemorySubmissionHistory::new())),
            samples: Arc::new(InMemorySampleLedger::default()),
            frontend_url: "http://localhost:5173".to_string(),
            secure_cookies: false,
        })
    }

    fn bearer(role: UserRole) -> String {
        let token = session::sign_session(Uuid::new_v4(), role, KEY, Utc::now()).unwrap();
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let app = routes(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_require_a_session() {
        let app = routes(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/counselor/patients")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forged_tokens_are_rejected() {
        let app = routes(test_state());
        let forged = session::sign_session(Uuid::new_v4(), UserRole::Researcher, b"not-the-key", Utc::now())
            .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/researcher/statistics")
                    .header(header::AUTHORIZATION, format!("Bearer {forged}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_role_is_forbidden_before_touching_the_database() {
        let app = routes(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/researcher/export")
                    .header(header::AUTHORIZATION, bearer(UserRole::Patient))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let app = routes(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/graphologist/samples/pending")
                    .header(header::AUTHORIZATION, bearer(UserRole::Counselor))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn malformed_email_is_a_bad_request() {
        let app = routes(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/resend-otp")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"email":"nobody"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patients_cannot_read_someone_elses_history() {
        let app = routes(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/history/{}", Uuid::new_v4()))
                    .header(header::AUTHORIZATION, bearer(UserRole::Patient))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
