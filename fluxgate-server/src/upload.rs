use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    config::UploadCredentials,
    error::{Result, ServerError},
};

/// Hosted image storage that returns a public URL for stored bytes.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, jpeg: Vec<u8>, public_id: &str) -> Result<String>;
}

/// Signed uploads against the Cloudinary upload API.
pub struct CloudinaryUploader {
    client: Client,
    credentials: UploadCredentials,
    base_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
}

#[derive(Deserialize)]
struct UploadErrorResponse {
    error: UploadErrorDetails,
}

#[derive(Deserialize)]
struct UploadErrorDetails {
    message: String,
}

impl CloudinaryUploader {
    pub fn with_base_url(credentials: UploadCredentials, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            credentials,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1_1/{}/image/upload",
            self.base_url.trim_end_matches('/'),
            self.credentials.cloud_name
        )
    }

    fn sign(&self, public_id: &str, timestamp: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(string_to_sign(public_id, timestamp).as_bytes());
        hasher.update(self.credentials.api_secret.expose_secret().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Signed parameters in alphabetical order, joined as a query string.
fn string_to_sign(public_id: &str, timestamp: u64) -> String {
    format!("public_id={public_id}&timestamp={timestamp}")
}

#[async_trait]
impl ImageUploader for CloudinaryUploader {
    async fn upload(&self, jpeg: Vec<u8>, public_id: &str) -> Result<String> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ServerError::Internal(format!("system clock before epoch: {e}")))?
            .as_secs();
        let signature = self.sign(public_id, timestamp);
        let file = format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(&jpeg));
        let timestamp = timestamp.to_string();

        let form = [
            ("file", file.as_str()),
            ("public_id", public_id),
            ("timestamp", timestamp.as_str()),
            ("api_key", self.credentials.api_key.as_str()),
            ("signature_algorithm", "sha256"),
            ("signature", signature.as_str()),
        ];

        tracing::debug!(public_id, bytes = jpeg.len(), "uploading image");

        let response = self
            .client
            .post(self.endpoint())
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "upload request failed");
                ServerError::Upload(format!("failed to reach upload service: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<UploadErrorResponse>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(%status, %message, "upload service error");
            return Err(ServerError::Upload(format!("{status}: {message}")));
        }

        let body: UploadResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse upload response");
            ServerError::Upload("unexpected upload response".to_string())
        })?;

        Ok(body.secure_url)
    }
}
