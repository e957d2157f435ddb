use crate::db::{self, DbAnalysis};
use crate::domain::analysis::{GraphPoint, ImageAnalysis};
use crate::domain::arrs::QuestionnaireResult;
use crate::domain::models::{anonymous_id, UserRole};
use crate::domain::statistics::{self, ResearchStatistics};
use crate::error::{AppError, AppResult};
use crate::state::SharedState;
use crate::web::session::AuthUser;
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Analysis with the patient reduced to an anonymous id and an age.
#[derive(Serialize)]
pub struct AnonymisedAnalysis {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub image_analysis: ImageAnalysis,
    pub questionnaire_analysis: QuestionnaireResult,
    pub combined_outcome: String,
    pub graph_data: Vec<GraphPoint>,
    pub patient_age: Option<i32>,
    pub patient_type: Option<UserRole>,
    pub anonymous_patient_id: String,
}

const EXPORT_HEADERS: [&str; 12] = [
    "Patient ID",
    "Date",
    "Image Analysis Outcome",
    "Image Analysis Confidence",
    "Questionnaire Outcome",
    "Questionnaire Score",
    "Combined Outcome",
    "Subscale 1 Average",
    "Subscale 2 Average",
    "Subscale 3 Average",
    "Subscale 4 Average",
    "Subscale 5 Average",
];

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/statistics", get(research_statistics))
        .route("/analyses", get(anonymised_analyses))
        .route("/export", get(export))
        .with_state(state)
}

async fn research_statistics(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<ResearchStatistics>> {
    auth.require(&[UserRole::Researcher])?;
    let analyses = db::analysis_facts(&state.pool).await?;
    let samples = db::sample_facts(&state.pool).await?;
    Ok(Json(statistics::build_statistics(
        &analyses,
        &samples,
        Utc::now().date_naive(),
    )))
}

fn anonymise(
    analysis: DbAnalysis,
    dob: Option<NaiveDate>,
    role: Option<UserRole>,
    today: NaiveDate,
) -> AnonymisedAnalysis {
    AnonymisedAnalysis {
        id: analysis.id,
        created_at: analysis.created_at,
        anonymous_patient_id: anonymous_id(analysis.patient_id),
        image_analysis: analysis.image_analysis.0,
        questionnaire_analysis: analysis.questionnaire_analysis.0,
        combined_outcome: analysis.combined_outcome,
        graph_data: analysis.graph_data.0,
        patient_age: dob.map(|d| statistics::age_on(d, today)),
        patient_type: role,
    }
}

async fn anonymised_analyses(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<AnonymisedAnalysis>>> {
    auth.require(&[UserRole::Researcher])?;
    let today = Utc::now().date_naive();
    let rows = db::research_analyses(&state.pool).await?;
    Ok(Json(
        rows.into_iter()
            .map(|row| anonymise(row.analysis, row.patient_dob, row.patient_role, today))
            .collect(),
    ))
}

/// One row per analysis; missing subscales export as empty cells.
pub fn export_csv(analyses: &[DbAnalysis]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_HEADERS)?;

    for analysis in analyses {
        let image = &analysis.image_analysis.0;
        let questionnaire = &analysis.questionnaire_analysis.0;
        let mut record = vec![
            analysis.patient_id.to_string(),
            analysis.created_at.to_rfc3339(),
            image.outcome.as_str().to_string(),
            image.confidence.to_string(),
            questionnaire.outcome.as_str().to_string(),
            questionnaire.score.to_string(),
            analysis.combined_outcome.clone(),
        ];
        record.extend((0..5).map(|i| {
            questionnaire
                .subscale_scores
                .get(i)
                .map(|s| s.average.to_string())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("csv flush failed: {}", e.error()))
}

async fn export(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> AppResult<impl IntoResponse> {
    auth.require(&[UserRole::Researcher])?;
    let analyses: Vec<DbAnalysis> = db::research_analyses(&state.pool)
        .await?
        .into_iter()
        .map(|row| row.analysis)
        .collect();
    if analyses.is_empty() {
        return Err(AppError::NotFound(
            "No analysis data available for export.".to_string(),
        ));
    }

    let body = export_csv(&analyses)?;
    tracing::info!("Researcher {} exported {} analyses", auth.user_id, analyses.len());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"analysis_data.csv\"",
            ),
        ],
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::analysis::{DualAssessment, ImageVerdict, IndicatorScores};
    use crate::domain::arrs::{score, LikertChoice, QUESTIONS};
    use sqlx::types::Json as SqlJson;
    use std::collections::BTreeMap;

    fn analysis(patient_id: Uuid) -> DbAnalysis {
        let answers = QUESTIONS
            .iter()
            .map(|q| (q.id, LikertChoice::StronglyDisagree))
            .collect();
        let image = ImageAnalysis {
            outcome: ImageVerdict::RelapseRisk,
            confidence: 62.5,
            scores: IndicatorScores {
                relapse: 5.0,
                recovery: 3.0,
            },
            features: BTreeMap::new(),
        };
        let assessment = DualAssessment::combine(image, score(&answers).unwrap());
        DbAnalysis {
            id: Uuid::new_v4(),
            patient_id,
            sample_id: None,
            created_at: Utc::now(),
            image_analysis: SqlJson(assessment.image_analysis),
            questionnaire_analysis: SqlJson(assessment.questionnaire_analysis),
            combined_outcome: assessment.combined_outcome,
            graph_data: SqlJson(assessment.graph_data),
        }
    }

    #[test]
    fn export_has_header_and_one_row_per_analysis() {
        let patient = Uuid::new_v4();
        let bytes = export_csv(&[analysis(patient), analysis(patient)]).unwrap();

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 12);
        assert_eq!(&headers[0], "Patient ID");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], patient.to_string());
        assert_eq!(&rows[0][2], "Relapse Risk");
        assert_eq!(&rows[0][3], "62.5");
        assert_eq!(&rows[0][6], "Relapse Risk");
    }

    #[test]
    fn anonymised_rows_hide_patient_id() {
        let patient = Uuid::new_v4();
        let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let dob = NaiveDate::from_ymd_opt(1990, 1, 1);
        let row = anonymise(analysis(patient), dob, Some(UserRole::Patient), today);
        assert_eq!(row.anonymous_patient_id, anonymous_id(patient));
        assert_eq!(row.patient_age, Some(34));

        let json = serde_json::to_value(&row).unwrap();
        assert!(!json.to_string().contains(&patient.to_string()));
    }
}
