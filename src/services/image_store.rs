use crate::config::ImageStoreConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const SAMPLE_FOLDER: &str = "handwriting-samples";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub url: String,
    pub public_id: String,
}

/// Durable storage for uploaded sample images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn store(&self, image: Vec<u8>, file_name: &str, mime: &str) -> Result<StoredImage>;
    /// Deletes an image that was stored but never attached to a sample.
    async fn remove(&self, public_id: &str) -> Result<()>;
}

/// Signed upload to a Cloudinary-compatible CDN.
#[derive(Clone)]
pub struct CdnImageStore {
    client: reqwest::Client,
    config: ImageStoreConfig,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    public_id: Option<String>,
    error: Option<UploadError>,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: Option<String>,
    error: Option<UploadError>,
}

#[derive(Deserialize)]
struct UploadError {
    message: String,
}

impl CdnImageStore {
    pub fn new(config: ImageStoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/image/{action}",
            self.config.cloud_name
        )
    }
}

/// Parameters sorted by name, joined as `k=v&k=v`, secret appended, SHA-256 hex.
pub fn sign_params(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[async_trait]
impl ImageStore for CdnImageStore {
    async fn store(&self, image: Vec<u8>, file_name: &str, mime: &str) -> Result<StoredImage> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("folder", SAMPLE_FOLDER), ("timestamp", &timestamp)],
            &self.config.api_secret,
        );

        let form = reqwest::multipart::Form::new()
            .text("api_key", self.config.api_key.clone())
            .text("timestamp", timestamp)
            .text("folder", SAMPLE_FOLDER)
            .text("signature_algorithm", "sha256")
            .text("signature", signature)
            .part(
                "file",
                reqwest::multipart::Part::bytes(image)
                    .file_name(file_name.to_string())
                    .mime_str(mime)?,
            );

        let body: UploadResponse = self
            .client
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await
            .context("image upload request failed")?
            .json()
            .await
            .context("image upload response unreadable")?;

        if let Some(err) = body.error {
            return Err(anyhow!("image upload rejected: {}", err.message));
        }
        match (body.secure_url, body.public_id) {
            (Some(url), Some(public_id)) => Ok(StoredImage { url, public_id }),
            _ => Err(anyhow!("image upload returned no secure_url")),
        }
    }

    async fn remove(&self, public_id: &str) -> Result<()> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("public_id", public_id), ("timestamp", &timestamp)],
            &self.config.api_secret,
        );

        let form = reqwest::multipart::Form::new()
            .text("api_key", self.config.api_key.clone())
            .text("public_id", public_id.to_string())
            .text("timestamp", timestamp)
            .text("signature_algorithm", "sha256")
            .text("signature", signature);

        let body: DestroyResponse = self
            .client
            .post(self.endpoint("destroy"))
            .multipart(form)
            .send()
            .await
            .context("image delete request failed")?
            .json()
            .await
            .context("image delete response unreadable")?;

        if let Some(err) = body.error {
            return Err(anyhow!("image delete rejected: {}", err.message));
        }
        match body.result.as_deref() {
            Some("ok") | Some("not found") => Ok(()),
            other => Err(anyhow!("image delete returned {:?}", other)),
        }
    }
}

/// Used when no CDN credentials are configured; every upload fails.
pub struct UnconfiguredImageStore;

#[async_trait]
impl ImageStore for UnconfiguredImageStore {
    async fn store(&self, _image: Vec<u8>, _file_name: &str, _mime: &str) -> Result<StoredImage> {
        Err(anyhow!("image storage is not configured"))
    }

    async fn remove(&self, _public_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_order_independent() {
        let a = sign_params(&[("timestamp", "1700000000"), ("folder", SAMPLE_FOLDER)], "s3cr3t");
        let b = sign_params(&[("folder", SAMPLE_FOLDER), ("timestamp", "1700000000")], "s3cr3t");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign_params(&[("folder", SAMPLE_FOLDER), ("timestamp", "1700000000")], "other"));
    }

    #[tokio::test]
    async fn unconfigured_store_refuses_uploads() {
        let err = UnconfiguredImageStore
            .store(vec![1, 2, 3], "a.png", "image/png")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
