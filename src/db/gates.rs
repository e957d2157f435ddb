//! Postgres-backed stores for the upload cooldown and the OTP request window.

use super::{NewSample, SampleInsert};
use crate::domain::cooldown::SubmissionHistory;
use crate::middleware::rate_limit::{RequestWindow, RequestWindowStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Sample insert that re-checks the cooldown atomically with the write.
#[async_trait]
pub trait SampleLedger: Send + Sync {
    async fn insert_if_eligible(&self, sample: &NewSample<'_>, now: DateTime<Utc>) -> Result<SampleInsert>;
}

#[derive(Clone)]
pub struct PgSampleLedger {
    pool: PgPool,
}

impl PgSampleLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SampleLedger for PgSampleLedger {
    async fn insert_if_eligible(&self, sample: &NewSample<'_>, now: DateTime<Utc>) -> Result<SampleInsert> {
        super::insert_sample_if_eligible(&self.pool, sample, now).await
    }
}

#[derive(Clone)]
pub struct PgSubmissionHistory {
    pool: PgPool,
}

impl PgSubmissionHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionHistory for PgSubmissionHistory {
    async fn last_submission(&self, patient_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        super::last_sample_at(&self.pool, patient_id).await
    }
}

#[derive(Clone)]
pub struct PgRequestWindows {
    pool: PgPool,
}

impl PgRequestWindows {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestWindowStore for PgRequestWindows {
    async fn record_request(
        &self,
        email: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RequestWindow> {
        // Single statement so concurrent requests cannot lose an increment or a restart.
        let (request_count, window_start): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO otp_requests (email, request_count, window_start)
            VALUES ($1, 1, $2)
            ON CONFLICT (email) DO UPDATE
                SET request_count = CASE
                        WHEN otp_requests.window_start < $3 THEN 1
                        ELSE otp_requests.request_count + 1
                    END,
                    window_start = CASE
                        WHEN otp_requests.window_start < $3 THEN EXCLUDED.window_start
                        ELSE otp_requests.window_start
                    END
            RETURNING request_count, window_start
            "#,
        )
        .bind(email)
        .bind(now)
        .bind(now - window)
        .fetch_one(&self.pool)
        .await?;

        Ok(RequestWindow {
            request_count,
            window_start,
        })
    }

    async fn clear(&self, email: &str) -> Result<()> {
        sqlx::query("DELETE FROM otp_requests WHERE email = $1")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM otp_requests WHERE window_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Ledger over the in-memory history, for handler tests that need the locked insert.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct InMemorySampleLedger {
    pub history: crate::domain::cooldown::InMemorySubmissionHistory,
}

#[cfg(test)]
#[async_trait]
impl SampleLedger for InMemorySampleLedger {
    async fn insert_if_eligible(&self, sample: &NewSample<'_>, now: DateTime<Utc>) -> Result<SampleInsert> {
        use crate::domain::models::SampleStatus;
        use sqlx::types::Json;

        let decision = self.history.record_if_eligible(sample.patient_id, now).await;
        if !decision.allowed {
            return Ok(SampleInsert::CooldownActive(decision));
        }
        Ok(SampleInsert::Inserted(super::DbSample {
            id: Uuid::new_v4(),
            patient_id: sample.patient_id,
            patient_pid: sample.patient_pid.to_string(),
            created_at: now,
            image_url: sample.image_url.to_string(),
            ai_prediction: sample.analysis.outcome.as_str().to_string(),
            confidence: sample.analysis.confidence,
            scores: Json(sample.analysis.scores),
            features: Some(Json(sample.analysis.features.clone())),
            status: SampleStatus::Pending,
            consented_for_research: false,
            review_word_spacing: None,
            review_pressure: None,
            review_qualitative: None,
            review_ai_agreement: None,
            reviewed_by: None,
            reviewed_at: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_user, NewUser};
    use crate::domain::analysis::{ImageAnalysis, ImageVerdict, IndicatorScores};
    use crate::domain::models::{patient_pid, UserRole};
    use crate::middleware::rate_limit::WINDOW_MINUTES;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn analysis() -> ImageAnalysis {
        ImageAnalysis {
            outcome: ImageVerdict::Recovery,
            confidence: 70.0,
            scores: IndicatorScores {
                relapse: 3.0,
                recovery: 7.0,
            },
            features: BTreeMap::new(),
        }
    }

    async fn patient(pool: &PgPool) -> Uuid {
        insert_user(
            pool,
            &NewUser {
                email: "pat@example.com",
                enc_phone: "sealed",
                hash: "hash",
                role: UserRole::Patient,
                enc_name: None,
                dob: None,
                has_accepted_disclaimer: true,
                counselor_id: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn window_upsert_increments_and_restarts_in_place(pool: PgPool) {
        let store = PgRequestWindows::new(pool);
        let window = Duration::minutes(WINDOW_MINUTES);

        for expected in 1..=3 {
            let record = store.record_request("pat@example.com", start(), window).await.unwrap();
            assert_eq!(record.request_count, expected);
            assert_eq!(record.window_start, start());
        }

        let later = start() + Duration::minutes(16);
        let first = store.record_request("pat@example.com", later, window).await.unwrap();
        let second = store.record_request("pat@example.com", later, window).await.unwrap();
        assert_eq!(first, RequestWindow { request_count: 1, window_start: later });
        assert_eq!(second, RequestWindow { request_count: 2, window_start: later });
    }

    #[sqlx::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn locked_insert_refuses_a_second_sample_inside_the_cooldown(pool: PgPool) {
        let patient_id = patient(&pool).await;
        let ledger = PgSampleLedger::new(pool.clone());
        let pid = patient_pid(patient_id);
        let analysis = analysis();
        let sample = NewSample {
            patient_id,
            patient_pid: &pid,
            image_url: "https://cdn.example.com/a.png",
            analysis: &analysis,
        };

        let first = ledger.insert_if_eligible(&sample, start()).await.unwrap();
        assert!(matches!(first, SampleInsert::Inserted(_)));

        let second = ledger
            .insert_if_eligible(&sample, start() + Duration::days(3))
            .await
            .unwrap();
        match second {
            SampleInsert::CooldownActive(decision) => {
                assert_eq!(decision.last_submission_at, Some(start()));
                assert_eq!(decision.next_eligible_at, Some(start() + Duration::days(20)));
            }
            SampleInsert::Inserted(_) => panic!("second sample should be refused"),
        }

        let third = ledger
            .insert_if_eligible(&sample, start() + Duration::days(20))
            .await
            .unwrap();
        assert!(matches!(third, SampleInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn in_memory_ledger_refuses_inside_the_cooldown() {
        let ledger = InMemorySampleLedger::default();
        let patient_id = Uuid::new_v4();
        let pid = patient_pid(patient_id);
        let analysis = analysis();
        let sample = NewSample {
            patient_id,
            patient_pid: &pid,
            image_url: "https://cdn.example.com/a.png",
            analysis: &analysis,
        };

        assert!(matches!(
            ledger.insert_if_eligible(&sample, start()).await.unwrap(),
            SampleInsert::Inserted(_)
        ));
        assert!(matches!(
            ledger.insert_if_eligible(&sample, start() + Duration::days(1)).await.unwrap(),
            SampleInsert::CooldownActive(_)
        ));
    }
}
