use crate::domain::analysis::{ImageAnalysis, ImageVerdict, IndicatorScores};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier rejected the image: {0}")]
    Rejected(String),
    #[error("classifier returned an unexpected payload")]
    Malformed,
}

/// Handwriting image classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: Vec<u8>, file_name: &str, mime: &str)
        -> Result<ImageAnalysis, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    prediction: Option<String>,
    #[serde(default)]
    scores: IndicatorScores,
    #[serde(default)]
    features: BTreeMap<String, serde_json::Value>,
    error: Option<String>,
}

impl ClassifierResponse {
    fn into_analysis(self) -> Result<ImageAnalysis, ClassifierError> {
        if let Some(error) = self.error {
            return Err(ClassifierError::Rejected(error));
        }
        let prediction = self.prediction.ok_or(ClassifierError::Malformed)?;
        let features = self
            .features
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();

        Ok(ImageAnalysis {
            outcome: ImageVerdict::parse(&prediction),
            confidence: self.scores.confidence(),
            scores: self.scores,
            features,
        })
    }
}

/// HTTP client for the external `/analyze` endpoint.
#[derive(Clone)]
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: String) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(CLASSIFIER_TIMEOUT)
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        image: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> Result<ImageAnalysis, ClassifierError> {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(image)
                .file_name(file_name.to_string())
                .mime_str(mime)?,
        );

        let resp = self.client.post(&self.url).multipart(form).send().await?;
        let status = resp.status();
        let body: ClassifierResponse = resp.json().await.map_err(|e| {
            tracing::error!("Classifier responded {} with unreadable body: {}", status, e);
            ClassifierError::Malformed
        })?;

        let analysis = body.into_analysis()?;
        tracing::info!(
            "Classifier verdict {} ({}% confidence)",
            analysis.outcome.as_str(),
            analysis.confidence
        );
        Ok(analysis)
    }
}
