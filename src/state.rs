use crate::crypto::PiiCipher;
use crate::db::gates::SampleLedger;
use crate::domain::cooldown::SampleCooldown;
use crate::middleware::OtpRateLimiter;
use crate::services::classifier::Classifier;
use crate::services::image_store::ImageStore;
use crate::services::mailer::Mailer;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cipher: Arc<PiiCipher>,
    pub session_key: Vec<u8>,
    pub classifier: Arc<dyn Classifier>,
    pub image_store: Arc<dyn ImageStore>,
    pub mailer: Arc<dyn Mailer>,
    pub otp_limiter: OtpRateLimiter,
    pub sample_cooldown: SampleCooldown,
    pub samples: Arc<dyn SampleLedger>,
    pub frontend_url: String,
    pub secure_cookies: bool,
}

pub type SharedState = Arc<AppState>;
