use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
#[cfg(test)]
use std::collections::HashMap;
use std::sync::Arc;
#[cfg(test)]
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DAYS_BETWEEN_UPLOADS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmissionDecision {
    pub allowed: bool,
    pub last_submission_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl SubmissionDecision {
    pub fn wait_message(&self) -> Option<String> {
        self.next_eligible_at.map(|next| {
            format!(
                "The patient must wait {DAYS_BETWEEN_UPLOADS} days between uploads. Their next submission is available on {}.",
                next.format("%Y-%m-%d")
            )
        })
    }
}

/// Pure cooldown rule: allowed once a full 20 days have passed since the last sample.
pub fn evaluate(last_submission: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SubmissionDecision {
    let cooldown = Duration::days(DAYS_BETWEEN_UPLOADS);
    match last_submission {
        None => SubmissionDecision {
            allowed: true,
            last_submission_at: None,
            next_eligible_at: None,
        },
        Some(last) => {
            let allowed = now - last >= cooldown;
            SubmissionDecision {
                allowed,
                last_submission_at: Some(last),
                next_eligible_at: (!allowed).then(|| last + cooldown),
            }
        }
    }
}

/// Most-recent-sample lookup per patient.
#[async_trait]
pub trait SubmissionHistory: Send + Sync {
    async fn last_submission(&self, patient_id: Uuid) -> Result<Option<DateTime<Utc>>>;
}

#[derive(Clone)]
pub struct SampleCooldown {
    history: Arc<dyn SubmissionHistory>,
}

impl SampleCooldown {
    pub fn new(history: Arc<dyn SubmissionHistory>) -> Self {
        Self { history }
    }

    pub async fn can_submit(&self, patient_id: Uuid, now: DateTime<Utc>) -> Result<SubmissionDecision> {
        let last = self.history.last_submission(patient_id).await?;
        let decision = evaluate(last, now);
        if !decision.allowed {
            tracing::debug!(
                "Sample cooldown active for patient {} until {:?}",
                patient_id,
                decision.next_eligible_at
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub struct InMemorySubmissionHistory {
    last: Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>,
}

#[cfg(test)]
impl InMemorySubmissionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, patient_id: Uuid, at: DateTime<Utc>) {
        let mut last = self.last.write().await;
        let entry = last.entry(patient_id).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    /// Check and record under one write lock, like the locked insert in Postgres.
    pub async fn record_if_eligible(&self, patient_id: Uuid, now: DateTime<Utc>) -> SubmissionDecision {
        let mut last = self.last.write().await;
        let decision = evaluate(last.get(&patient_id).copied(), now);
        if decision.allowed {
            last.insert(patient_id, now);
        }
        decision
    }
}

#[cfg(test)]
#[async_trait]
impl SubmissionHistory for InMemorySubmissionHistory {
    async fn last_submission(&self, patient_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last.read().await.get(&patient_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_submission_is_always_allowed() {
        let decision = evaluate(None, now());
        assert!(decision.allowed);
        assert!(decision.next_eligible_at.is_none());
        assert!(decision.wait_message().is_none());
    }

    #[test]
    fn nineteen_days_is_too_early() {
        let last = now() - Duration::days(19);
        let decision = evaluate(Some(last), now());
        assert!(!decision.allowed);
        assert_eq!(decision.next_eligible_at, Some(last + Duration::days(20)));
        assert!(decision
            .wait_message()
            .unwrap()
            .contains("2024-03-16"));
    }

    #[test]
    fn twenty_days_boundary_is_inclusive() {
        let decision = evaluate(Some(now() - Duration::days(20)), now());
        assert!(decision.allowed);
        assert!(decision.next_eligible_at.is_none());

        let just_short = now() - Duration::days(20) + Duration::seconds(1);
        assert!(!evaluate(Some(just_short), now()).allowed);
    }

    #[tokio::test]
    async fn gate_reads_latest_submission() {
        let history = InMemorySubmissionHistory::new();
        let gate = SampleCooldown::new(Arc::new(history.clone()));
        let patient = Uuid::new_v4();

        assert!(gate.can_submit(patient, now()).await.unwrap().allowed);

        history.record(patient, now() - Duration::days(30)).await;
        history.record(patient, now() - Duration::days(5)).await;
        history.record(patient, now() - Duration::days(40)).await;

        let decision = gate.can_submit(patient, now()).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.last_submission_at, Some(now() - Duration::days(5)));

        let other = Uuid::new_v4();
        assert!(gate.can_submit(other, now()).await.unwrap().allowed);
    }
}
