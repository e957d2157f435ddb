//! ARRS questionnaire: fixed 27-item instrument and its scoring.
//! - Likert answers 1..=3, reversed items scored as 4 - answer
//! - Subscale mean per thematic group, overall = unweighted mean of subscales
//! - Recovery iff overall (2 d.p.) <= 2.00
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type QuestionId = u8;

pub const QUESTION_COUNT: usize = 27;

/// Overall score at or below this value (in hundredths) is read as recovery.
const RECOVERY_THRESHOLD_HUNDREDTHS: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscale {
    Craving,
    Emotion,
    Motive,
    SelfControl,
    Consequence,
}

impl Subscale {
    pub const ALL: [Subscale; 5] = [
        Subscale::Craving,
        Subscale::Emotion,
        Subscale::Motive,
        Subscale::SelfControl,
        Subscale::Consequence,
    ];

    pub fn id(&self) -> u8 {
        match self {
            Subscale::Craving => 1,
            Subscale::Emotion => 2,
            Subscale::Motive => 3,
            Subscale::SelfControl => 4,
            Subscale::Consequence => 5,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Subscale::Craving => "craving (alcohol craving)",
            Subscale::Emotion => "emotion (negative feelings)",
            Subscale::Motive => "motive (economic/job-related problems)",
            Subscale::SelfControl => "self-control (lack of self-control)",
            Subscale::Consequence => "consequence (negative consequences of drinking)",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Question {
    pub id: QuestionId,
    pub text: &'static str,
    pub subscale: Subscale,
    pub reversed: bool,
}

const fn q(id: QuestionId, text: &'static str, subscale: Subscale, reversed: bool) -> Question {
    Question {
        id,
        text,
        subscale,
        reversed,
    }
}

pub static QUESTIONS: [Question; QUESTION_COUNT] = [
    q(1, "It would be difficult for me to refuse if someone placed alcohol in front of me.", Subscale::Craving, false),
    q(2, "If someone held alcohol under my nose, I would not be able to refuse it.", Subscale::Craving, false),
    q(3, "I would drink alcohol if my friends offered it to me on a street.", Subscale::Craving, false),
    q(4, "I would drink alcohol if I am alone.", Subscale::Craving, false),
    q(5, "If my friend gave me alcohol, I would drink it even in the hospital.", Subscale::Craving, false),
    q(6, "If alcohol is placed in front of me, I would drink it.", Subscale::Craving, false),
    q(7, "I might drink alcohol at a party or a gathering.", Subscale::Craving, false),
    q(8, "I am annoyed by words from others.", Subscale::Emotion, false),
    q(9, "I am irritated.", Subscale::Emotion, false),
    q(10, "I am not motivated to do anything.", Subscale::Emotion, false),
    q(11, "I feel lonely.", Subscale::Emotion, false),
    q(12, "I feel bored.", Subscale::Emotion, false),
    q(13, "I am anxious about my future.", Subscale::Emotion, false),
    q(14, "I cannot control my feeling.", Subscale::Emotion, false),
    q(15, "I would do almost anything in order to drink alcohol.", Subscale::Motive, false),
    q(16, "I have significant job-related problems.", Subscale::Motive, false),
    q(17, "I would do anything to get money for alcohol.", Subscale::Motive, false),
    q(18, "I want alcohol even if I have to steal.", Subscale::Motive, false),
    q(19, "I can stop drinking alcohol by myself.", Subscale::SelfControl, true),
    q(20, "If I drink a small amount of alcohol, I would not be able to stop drinking.", Subscale::SelfControl, true),
    q(21, "I am confident that I would not drink alcohol again.", Subscale::SelfControl, true),
    q(22, "I would be fine without alcohol.", Subscale::SelfControl, true),
    q(23, "I have already recovered from alcohol abuse.", Subscale::SelfControl, true),
    q(24, "I would not be able to control myself if I drink alcohol.", Subscale::SelfControl, true),
    q(25, "If I drink alcohol, it would badly influence my job.", Subscale::Consequence, true),
    q(26, "I think I am an addict.", Subscale::Consequence, false),
    q(27, "I would feel restless if I drank alcohol.", Subscale::Consequence, true),
];

pub fn find_question(id: QuestionId) -> Option<&'static Question> {
    QUESTIONS.iter().find(|q| q.id == id)
}

/// Three-point Likert choice as submitted by the patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LikertChoice {
    StronglyDisagree,
    Neither,
    StronglyAgree,
}

impl LikertChoice {
    pub fn value(&self) -> u8 {
        match self {
            LikertChoice::StronglyDisagree => 1,
            LikertChoice::Neither => 2,
            LikertChoice::StronglyAgree => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LikertChoice::StronglyDisagree => "Strongly Disagree (X)",
            LikertChoice::Neither => "Neither (△)",
            LikertChoice::StronglyAgree => "Strongly Agree (○)",
        }
    }
}

impl TryFrom<u8> for LikertChoice {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LikertChoice::StronglyDisagree),
            2 => Ok(LikertChoice::Neither),
            3 => Ok(LikertChoice::StronglyAgree),
            other => Err(format!("answer must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<LikertChoice> for u8 {
    fn from(choice: LikertChoice) -> Self {
        choice.value()
    }
}

pub type Answers = BTreeMap<QuestionId, LikertChoice>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Recovery,
    #[serde(rename = "Relapse Risk")]
    RelapseRisk,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Recovery => "Recovery",
            Outcome::RelapseRisk => "Relapse Risk",
        }
    }
}

impl TryFrom<&str> for Outcome {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "Recovery" => Ok(Outcome::Recovery),
            "Relapse Risk" => Ok(Outcome::RelapseRisk),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscaleScore {
    pub subscale_id: u8,
    pub description: String,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerDetail {
    pub text: String,
    pub answer: String,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireResult {
    pub outcome: Outcome,
    pub score: f64,
    pub subscale_scores: Vec<SubscaleScore>,
    pub raw_answers: BTreeMap<QuestionId, AnswerDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringError {
    #[error("questionnaire incomplete: {} unanswered question(s)", .missing.len())]
    Incomplete { missing: Vec<QuestionId> },
    #[error("subscale {0} has no scored questions")]
    EmptySubscale(u8),
    #[error("unknown question id {0}")]
    UnknownQuestion(QuestionId),
}

/// Effective score of one answer; higher always leans towards relapse.
pub fn effective_score(question: &Question, answer: LikertChoice) -> u8 {
    if question.reversed {
        4 - answer.value()
    } else {
        answer.value()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn score(answers: &Answers) -> Result<QuestionnaireResult, ScoringError> {
    if let Some(unknown) = answers.keys().find(|id| find_question(**id).is_none()) {
        return Err(ScoringError::UnknownQuestion(*unknown));
    }

    let missing: Vec<QuestionId> = QUESTIONS
        .iter()
        .filter(|q| !answers.contains_key(&q.id))
        .map(|q| q.id)
        .collect();
    if !missing.is_empty() {
        return Err(ScoringError::Incomplete { missing });
    }

    let mut grouped: BTreeMap<Subscale, Vec<u8>> = BTreeMap::new();
    let mut raw_answers = BTreeMap::new();
    for question in QUESTIONS.iter() {
        let Some(answer) = answers.get(&question.id) else {
            continue;
        };
        let effective = effective_score(question, *answer);
        grouped.entry(question.subscale).or_default().push(effective);
        raw_answers.insert(
            question.id,
            AnswerDetail {
                text: question.text.to_string(),
                answer: answer.label().to_string(),
                score: effective,
            },
        );
    }

    let mut subscale_scores = Vec::with_capacity(Subscale::ALL.len());
    let mut subscale_means = Vec::with_capacity(Subscale::ALL.len());
    for subscale in Subscale::ALL {
        let scores = grouped.get(&subscale).map(Vec::as_slice).unwrap_or_default();
        if scores.is_empty() {
            return Err(ScoringError::EmptySubscale(subscale.id()));
        }
        let mean = scores.iter().map(|s| f64::from(*s)).sum::<f64>() / scores.len() as f64;
        subscale_means.push(mean);
        subscale_scores.push(SubscaleScore {
            subscale_id: subscale.id(),
            description: subscale.description().to_string(),
            average: round2(mean),
        });
    }

    let overall = subscale_means.iter().sum::<f64>() / subscale_means.len() as f64;
    let hundredths = (overall * 100.0).round() as i64;
    let outcome = if hundredths <= RECOVERY_THRESHOLD_HUNDREDTHS {
        Outcome::Recovery
    } else {
        Outcome::RelapseRisk
    };

    Ok(QuestionnaireResult {
        outcome,
        score: hundredths as f64 / 100.0,
        subscale_scores,
        raw_answers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(choice: LikertChoice) -> Answers {
        QUESTIONS.iter().map(|q| (q.id, choice)).collect()
    }

    fn averages(result: &QuestionnaireResult) -> Vec<f64> {
        result.subscale_scores.iter().map(|s| s.average).collect()
    }

    #[test]
    fn question_table_is_complete() {
        assert_eq!(QUESTIONS.len(), QUESTION_COUNT);
        for (idx, question) in QUESTIONS.iter().enumerate() {
            assert_eq!(question.id as usize, idx + 1);
        }
        for subscale in Subscale::ALL {
            assert!(QUESTIONS.iter().any(|q| q.subscale == subscale));
        }
    }

    #[test]
    fn reversed_items_flip_the_scale() {
        let reversed = find_question(19).unwrap();
        assert!(reversed.reversed);
        assert_eq!(effective_score(reversed, LikertChoice::StronglyDisagree), 3);
        assert_eq!(effective_score(reversed, LikertChoice::Neither), 2);
        assert_eq!(effective_score(reversed, LikertChoice::StronglyAgree), 1);

        let plain = find_question(1).unwrap();
        assert!(!plain.reversed);
        assert_eq!(effective_score(plain, LikertChoice::StronglyDisagree), 1);
        assert_eq!(effective_score(plain, LikertChoice::StronglyAgree), 3);
    }

    #[test]
    fn all_strongly_disagree_is_recovery() {
        let result = score(&uniform(LikertChoice::StronglyDisagree)).unwrap();
        assert_eq!(averages(&result), vec![1.0, 1.0, 1.0, 3.0, 2.33]);
        assert_eq!(result.score, 1.67);
        assert_eq!(result.outcome, Outcome::Recovery);
        assert_eq!(result.raw_answers[&19].score, 3);
        assert_eq!(result.raw_answers[&26].score, 1);
        assert_eq!(result.raw_answers[&1].answer, "Strongly Disagree (X)");
    }

    #[test]
    fn all_strongly_agree_is_relapse_risk() {
        let result = score(&uniform(LikertChoice::StronglyAgree)).unwrap();
        assert_eq!(averages(&result), vec![3.0, 3.0, 3.0, 1.0, 1.67]);
        assert_eq!(result.score, 2.33);
        assert_eq!(result.outcome, Outcome::RelapseRisk);
    }

    #[test]
    fn midpoint_ties_resolve_to_recovery() {
        let result = score(&uniform(LikertChoice::Neither)).unwrap();
        assert_eq!(result.score, 2.0);
        assert_eq!(result.outcome, Outcome::Recovery);
    }

    #[test]
    fn outcome_follows_the_rounded_overall_score() {
        // Full-precision overall is 2.00238; the stored score and the outcome both use 2.00.
        let mut answers = uniform(LikertChoice::StronglyDisagree);
        for id in [1, 2, 3, 8, 9, 10, 11, 12, 13, 14, 15, 25, 27] {
            answers.insert(id, LikertChoice::Neither);
        }
        answers.insert(26, LikertChoice::StronglyAgree);

        let result = score(&answers).unwrap();
        assert_eq!(averages(&result), vec![1.43, 2.0, 1.25, 3.0, 2.33]);
        assert_eq!(result.score, 2.0);
        assert_eq!(result.outcome, Outcome::Recovery);
    }

    #[test]
    fn subscales_are_weighted_equally() {
        // Craving carries 7 items and motive only 4; each still counts as one fifth.
        let mut answers = uniform(LikertChoice::Neither);
        for id in 15..=18 {
            answers.insert(id, LikertChoice::StronglyAgree);
        }
        let result = score(&answers).unwrap();
        assert_eq!(result.subscale_scores[2].average, 3.0);
        assert_eq!(result.score, 2.2);
        assert_eq!(result.outcome, Outcome::RelapseRisk);
    }

    #[test]
    fn missing_any_question_is_incomplete() {
        for question in QUESTIONS.iter() {
            let mut answers = uniform(LikertChoice::Neither);
            answers.remove(&question.id);
            assert_eq!(
                score(&answers),
                Err(ScoringError::Incomplete {
                    missing: vec![question.id]
                })
            );
        }
        assert!(matches!(
            score(&Answers::new()),
            Err(ScoringError::Incomplete { missing }) if missing.len() == QUESTION_COUNT
        ));
    }

    #[test]
    fn unknown_question_is_rejected() {
        let mut answers = uniform(LikertChoice::Neither);
        answers.insert(28, LikertChoice::Neither);
        assert_eq!(score(&answers), Err(ScoringError::UnknownQuestion(28)));
    }

    #[test]
    fn answers_deserialize_from_json_object() {
        let mut raw = serde_json::Map::new();
        for question in QUESTIONS.iter() {
            raw.insert(question.id.to_string(), serde_json::json!(1));
        }
        let answers: Answers = serde_json::from_value(serde_json::Value::Object(raw)).unwrap();
        assert_eq!(answers.len(), QUESTION_COUNT);

        let bad: Result<Answers, _> = serde_json::from_value(serde_json::json!({ "1": 4 }));
        assert!(bad.is_err());
    }

    #[test]
    fn outcome_serializes_with_display_names() {
        assert_eq!(
            serde_json::to_value(Outcome::RelapseRisk).unwrap(),
            serde_json::json!("Relapse Risk")
        );
        assert_eq!(Outcome::try_from("Recovery"), Ok(Outcome::Recovery));
    }
}
