use crate::domain::models::AiAgreement;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct AnalysisFact {
    pub combined_outcome: String,
    pub patient_dob: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct SampleFact {
    pub ai_prediction: String,
    pub ai_agreement: Option<AiAgreement>,
    pub features: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutcomeTally {
    pub total: i64,
    pub recovery: i64,
    pub relapse: i64,
}

impl OutcomeTally {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tally = Self::default();
        for outcome in outcomes {
            tally.total += 1;
            if outcome == "Recovery" {
                tally.recovery += 1;
            } else {
                tally.relapse += 1;
            }
        }
        tally
    }

    pub fn recovery_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round1(self.recovery as f64 / self.total as f64 * 100.0)
    }

    pub fn relapse_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round1(100.0 - self.recovery_rate())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgeGroup {
    pub range: String,
    pub recovery: i64,
    pub relapse: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewScenario {
    pub scenario: &'static str,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCorrelation {
    pub feature: &'static str,
    pub correlation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchStatistics {
    pub total_analyses: i64,
    pub recovery_rate: f64,
    pub relapse_risk_rate: f64,
    pub age_groups: Vec<AgeGroup>,
    pub feature_correlations: Vec<FeatureCorrelation>,
    pub review_comparison: Vec<ReviewScenario>,
}

const AGE_BUCKETS: [(&str, u32, u32); 4] = [
    ("18-30", 18, 30),
    ("31-45", 31, 45),
    ("46-60", 46, 60),
    ("60+", 61, 120),
];

pub const UNKNOWN_AGE_LABEL: &str = "Unknown";

const FEATURES: [(&str, &str); 6] = [
    ("Word Spacing", "spacing"),
    ("Pressure", "pressure"),
    ("G-Loop", "g_loop"),
    ("Y-Loop", "y_loop"),
    ("Letter Size", "letter_size"),
    ("Slant Angle", "slant"),
];

const SCENARIOS: [&str; 5] = [
    "AI & Graphologist both predicted Recovery",
    "AI & Graphologist both predicted Relapse",
    "AI predicted Recovery, Graphologist Disagreed",
    "AI predicted Relapse, Graphologist Disagreed",
    "AI Predictions (No Human Review Yet)",
];

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Whole years between `dob` and `today`, counting a birthday only once it has passed.
pub fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

pub fn age_groups(facts: &[AnalysisFact], today: NaiveDate) -> Vec<AgeGroup> {
    let mut groups: Vec<AgeGroup> = AGE_BUCKETS
        .iter()
        .map(|(range, _, _)| AgeGroup {
            range: range.to_string(),
            recovery: 0,
            relapse: 0,
        })
        .collect();
    let mut unknown = AgeGroup {
        range: UNKNOWN_AGE_LABEL.to_string(),
        recovery: 0,
        relapse: 0,
    };

    for fact in facts {
        let bucket = fact
            .patient_dob
            .map(|dob| age_on(dob, today))
            .and_then(|age| {
                AGE_BUCKETS
                    .iter()
                    .position(|(_, min, max)| age >= *min as i32 && age <= *max as i32)
            });
        let group = match bucket {
            Some(idx) => &mut groups[idx],
            None => &mut unknown,
        };
        if fact.combined_outcome == "Recovery" {
            group.recovery += 1;
        } else {
            group.relapse += 1;
        }
    }

    if unknown.recovery + unknown.relapse > 0 {
        groups.push(unknown);
    }
    groups
}

pub fn review_comparison(samples: &[SampleFact]) -> Vec<ReviewScenario> {
    let mut counts = [0i64; 5];
    for sample in samples {
        let ai_recovery = sample.ai_prediction == "Recovery";
        let idx = match (sample.ai_agreement, ai_recovery) {
            (Some(AiAgreement::Agree), true) => 0,
            (Some(AiAgreement::Agree), false) => 1,
            (Some(AiAgreement::Disagree), true) => 2,
            (Some(AiAgreement::Disagree), false) => 3,
            (None, _) => 4,
        };
        counts[idx] += 1;
    }
    SCENARIOS
        .iter()
        .zip(counts)
        .map(|(scenario, count)| ReviewScenario {
            scenario: *scenario,
            count,
        })
        .collect()
}

pub fn feature_correlations(samples: &[SampleFact]) -> Vec<FeatureCorrelation> {
    let mut correlations = Vec::new();

    for (display, key) in FEATURES {
        let valid: Vec<(&SampleFact, f64)> = samples
            .iter()
            .filter_map(|s| {
                let raw = s.features.as_ref()?.get(key)?;
                Some((s, raw.trim().parse::<f64>().unwrap_or(0.0)))
            })
            .collect();
        if valid.len() < 2 {
            continue;
        }

        let recovery: Vec<f64> = valid
            .iter()
            .filter(|(s, _)| s.ai_prediction == "Recovery")
            .map(|(_, v)| *v)
            .collect();
        let relapse: Vec<f64> = valid
            .iter()
            .filter(|(s, _)| s.ai_prediction != "Recovery")
            .map(|(_, v)| *v)
            .collect();
        if recovery.is_empty() || relapse.is_empty() {
            continue;
        }

        let recovery_avg = mean(&recovery);
        let relapse_avg = mean(&relapse);
        let spread = (recovery_avg - relapse_avg).abs() / recovery_avg.max(relapse_avg).max(1.0);

        correlations.push(FeatureCorrelation {
            feature: display,
            correlation: format!("{:.2}", spread.min(0.99)),
        });
    }

    if correlations.is_empty() {
        return FEATURES
            .iter()
            .map(|(display, _)| FeatureCorrelation {
                feature: *display,
                correlation: "N/A".to_string(),
            })
            .collect();
    }
    correlations
}

pub fn build_statistics(
    analyses: &[AnalysisFact],
    samples: &[SampleFact],
    today: NaiveDate,
) -> ResearchStatistics {
    let tally = OutcomeTally::from_outcomes(analyses.iter().map(|a| a.combined_outcome.as_str()));
    let correlations = if analyses.is_empty() {
        feature_correlations(&[])
    } else {
        feature_correlations(samples)
    };

    ResearchStatistics {
        total_analyses: tally.total,
        recovery_rate: tally.recovery_rate(),
        relapse_risk_rate: tally.relapse_rate(),
        age_groups: age_groups(analyses, today),
        feature_correlations: correlations,
        review_comparison: review_comparison(samples),
    }
}
