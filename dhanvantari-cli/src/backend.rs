use crate::error::BackendError;
use dhanvantari_shared::{DiagnosisType, MedicineScanResponse, VisualDiagnosisResponse};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, error, info};

/// Client for the wellness backend's image endpoints.
pub struct BackendClient {
    http: Client,
    base_url: String,
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Pull a readable message out of an error response: `detail`, then
/// `error`, then the whole JSON body, then the raw text.
fn api_error_message(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(body) => {
            for key in ["detail", "error"] {
                match body.get(key) {
                    Some(serde_json::Value::String(s)) => return s.clone(),
                    Some(serde_json::Value::Null) | None => {}
                    Some(other) => return other.to_string(),
                }
            }
            body.to_string()
        }
        Err(_) => text.to_string(),
    }
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn scan_medicine(&self, image: &Path) -> Result<MedicineScanResponse, BackendError> {
        let form = Form::new().part("file", image_part(image).await?);
        let url = format!("{}/api/v1/medicine/scan", self.base_url);
        info!("Scanning medicine image {}", image.display());

        let response = self.http.post(&url).multipart(form).send().await?;
        decode(response).await
    }

    pub async fn analyze_diagnosis(
        &self,
        image: &Path,
        diagnosis_type: DiagnosisType,
    ) -> Result<VisualDiagnosisResponse, BackendError> {
        // The backend reads the type from the query; the form field is for
        // deployments that read it from the body.
        let form = Form::new()
            .part("file", image_part(image).await?)
            .text("diagnosis_type", diagnosis_type.as_str());
        let url = format!("{}/api/v1/diagnosis/analyze", self.base_url);
        info!("Running {} diagnosis on {}", diagnosis_type, image.display());

        let response = self
            .http
            .post(&url)
            .query(&[("diagnosis_type", diagnosis_type.as_str())])
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }
}

async fn image_part(path: &Path) -> Result<Part, BackendError> {
    let mime = image_mime(path).ok_or(BackendError::NotAnImage)?;
    let bytes = tokio::fs::read(path).await.map_err(|source| BackendError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    debug!("Uploading {} ({} bytes, {})", file_name, bytes.len(), mime);

    Ok(Part::bytes(bytes).file_name(file_name).mime_str(mime)?)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = api_error_message(&text);
        error!("Backend returned {}: {}", status, message);
        return Err(BackendError::Api(message));
    }
    Ok(response.json::<T>().await?)
}
