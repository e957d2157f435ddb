use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use std::env;

#[derive(Debug, Clone)]
pub struct ImageStoreConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub session_key: Vec<u8>,
    pub enc_key_b64: String,
    pub classifier_url: String,
    pub image_store: Option<ImageStoreConfig>,
    pub mail: Option<MailConfig>,
    pub frontend_url: String,
    pub secure_cookies: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL missing")?;

        let session_key_b64 = env::var("SESSION_KEY").context("SESSION_KEY missing")?;
        let session_key = general_purpose::STANDARD
            .decode(session_key_b64.trim())
            .map_err(|_| anyhow!("SESSION_KEY must be base64"))?;
        if session_key.len() < 32 {
            return Err(anyhow!("SESSION_KEY must decode to at least 32 bytes"));
        }

        let enc_key_b64 = env::var("APP_ENC_KEY").context("APP_ENC_KEY missing")?;

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| {
            let port = env::var("PORT").unwrap_or_else(|_| "5001".to_string());
            format!("0.0.0.0:{}", port)
        });

        let classifier_url = env::var("CLASSIFIER_URL")
            .unwrap_or_else(|_| "http://localhost:5000/analyze".to_string());

        let image_store = match (
            env::var("IMAGE_CLOUD_NAME"),
            env::var("IMAGE_API_KEY"),
            env::var("IMAGE_API_SECRET"),
        ) {
            (Ok(cloud_name), Ok(api_key), Ok(api_secret)) => Some(ImageStoreConfig {
                cloud_name,
                api_key,
                api_secret,
            }),
            _ => None,
        };

        let mail = match (env::var("MAIL_API_URL"), env::var("MAIL_API_KEY")) {
            (Ok(api_url), Ok(api_key)) => Some(MailConfig {
                api_url,
                api_key,
                from: env::var("MAIL_FROM")
                    .unwrap_or_else(|_| "Handwriting App <no-reply@localhost>".to_string()),
            }),
            _ => None,
        };

        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());

        let secure_cookies = env::var("PRODUCTION").is_ok()
            || env::var("RAILWAY_ENVIRONMENT").is_ok()
            || env::var("FLY_APP_NAME").is_ok();

        Ok(Self {
            database_url,
            bind_addr,
            session_key,
            enc_key_b64,
            classifier_url,
            image_store,
            mail,
            frontend_url,
            secure_cookies,
        })
    }
}
