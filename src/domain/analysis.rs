use crate::domain::arrs::{Outcome, QuestionnaireResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Verdict returned by the handwriting classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageVerdict {
    Recovery,
    #[serde(rename = "Relapse Risk")]
    RelapseRisk,
    Inconclusive,
}

impl ImageVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVerdict::Recovery => "Recovery",
            ImageVerdict::RelapseRisk => "Relapse Risk",
            ImageVerdict::Inconclusive => "Inconclusive",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "Recovery" => ImageVerdict::Recovery,
            "Relapse Risk" => ImageVerdict::RelapseRisk,
            _ => ImageVerdict::Inconclusive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorScores {
    #[serde(default)]
    pub relapse: f64,
    #[serde(default)]
    pub recovery: f64,
}

impl IndicatorScores {
    /// Share of the dominant indicator in percent, one decimal. 50.0 with no signal.
    pub fn confidence(&self) -> f64 {
        let total = self.relapse + self.recovery;
        if total <= 0.0 {
            return 50.0;
        }
        let share = self.relapse.max(self.recovery) / total * 100.0;
        (share * 10.0).round() / 10.0
    }

    pub fn graph_data(&self) -> Vec<GraphPoint> {
        vec![
            GraphPoint {
                label: "Recovery Indicators".to_string(),
                value: self.recovery,
            },
            GraphPoint {
                label: "Relapse Risk Indicators".to_string(),
                value: self.relapse,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub outcome: ImageVerdict,
    pub confidence: f64,
    pub scores: IndicatorScores,
    pub features: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualAssessment {
    pub image_analysis: ImageAnalysis,
    pub questionnaire_analysis: QuestionnaireResult,
    pub combined_outcome: String,
    pub graph_data: Vec<GraphPoint>,
}

impl DualAssessment {
    /// The handwriting verdict is the headline outcome; the questionnaire is shown alongside it.
    pub fn combine(image_analysis: ImageAnalysis, questionnaire: QuestionnaireResult) -> Self {
        let graph_data = image_analysis.scores.graph_data();
        Self {
            combined_outcome: image_analysis.outcome.as_str().to_string(),
            image_analysis,
            questionnaire_analysis: questionnaire,
            graph_data,
        }
    }

    pub fn signals_agree(&self) -> bool {
        matches!(
            (self.image_analysis.outcome, self.questionnaire_analysis.outcome),
            (ImageVerdict::Recovery, Outcome::Recovery)
                | (ImageVerdict::RelapseRisk, Outcome::RelapseRisk)
        )
    }
}
