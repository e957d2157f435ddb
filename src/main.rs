mod config;
mod crypto;
mod db;
mod domain;
mod error;
mod middleware;
mod services;
mod state;
mod web;

use crate::config::AppConfig;
use crate::db::gates::{PgRequestWindows, PgSampleLedger, PgSubmissionHistory};
use crate::domain::cooldown::SampleCooldown;
use crate::middleware::OtpRateLimiter;
use crate::services::classifier::HttpClassifier;
use crate::services::image_store::{CdnImageStore, ImageStore, UnconfiguredImageStore};
use crate::services::mailer::{HttpMailer, LogMailer, Mailer};
use crate::state::{AppState, SharedState};
use axum::{
    http::{header, HeaderValue, Method},
    routing::get_service,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to run database migrations: {}", e);
            e
        })?;
    tracing::info!("Database migrations completed");

    let cipher = crypto::PiiCipher::from_base64_key(&config.enc_key_b64)?;

    let image_store: Arc<dyn ImageStore> = match config.image_store.clone() {
        Some(cdn) => Arc::new(CdnImageStore::new(cdn)),
        None => {
            tracing::warn!("IMAGE_CLOUD_NAME/IMAGE_API_KEY/IMAGE_API_SECRET not set; sample uploads will fail");
            Arc::new(UnconfiguredImageStore)
        }
    };
    let mailer: Arc<dyn Mailer> = match config.mail.clone() {
        Some(mail) => Arc::new(HttpMailer::new(mail)),
        None => {
            tracing::warn!("MAIL_API_URL/MAIL_API_KEY not set; emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let shared: SharedState = Arc::new(AppState {
        pool: pool.clone(),
        cipher: Arc::new(cipher),
        session_key: config.session_key.clone(),
        classifier: Arc::new(HttpClassifier::new(config.classifier_url.clone())?),
        image_store,
        mailer,
        otp_limiter: OtpRateLimiter::new(Arc::new(PgRequestWindows::new(pool.clone()))),
        sample_cooldown: SampleCooldown::new(Arc::new(PgSubmissionHistory::new(pool.clone()))),
        samples: Arc::new(PgSampleLedger::new(pool)),
        frontend_url: config.frontend_url.clone(),
        secure_cookies: config.secure_cookies,
    });

    let scheduler = JobScheduler::new().await?;

    // Expired codes, reset tokens and stale rate-limit windows - hourly
    let shared_for_cleanup = shared.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let state = shared_for_cleanup.clone();
            Box::pin(async move {
                let now = chrono::Utc::now();
                match db::purge_expired_codes(&state.pool, now).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("Removed {} expired OTP codes and reset tokens", removed)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Failed to purge expired codes: {}", e),
                }
                if let Err(e) = state.otp_limiter.cleanup(now).await {
                    tracing::error!("Failed to purge rate-limit windows: {}", e);
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("Scheduler started: hourly cleanup of codes, tokens and rate-limit windows");

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_url.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let static_handler = ServeDir::new("static").not_found_service(ServeFile::new("static/index.html"));

    let app = Router::new()
        .merge(web::routes(shared))
        .fallback_service(get_service(static_handler))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
