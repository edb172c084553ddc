use async_trait::async_trait;

use crate::{error::Result, models::{AnalyzeResponse, FileBlob}};

/// Remote service that analyses one uploaded image at a time
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Upload a single file and return the decoded response envelope.
    ///
    /// Transport failures, non-success statuses and undecodable bodies are errors;
    /// an envelope with `success: false` is not.
    async fn analyze(&self, file: &FileBlob) -> Result<AnalyzeResponse>;
}

#[cfg(feature = "http")]
pub use http::HttpAnalysisService;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{
        Client,
        multipart::{Form, Part},
    };
    use tracing::{debug, warn};

    use super::AnalysisService;
    use crate::{
        error::{Result, ScanError},
        models::{AnalyzeResponse, FileBlob},
    };

    /// `AnalysisService` backed by an HTTP endpoint accepting a multipart `file` field
    #[derive(Clone)]
    pub struct HttpAnalysisService {
        client: Client,
        endpoint: String,
    }

    impl HttpAnalysisService {
        pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ScanError::Transport(e.to_string()))?;

            Ok(Self::with_client(client, endpoint))
        }

        pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
            Self {
                client,
                endpoint: endpoint.into(),
            }
        }

        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }

        fn build_form(file: &FileBlob) -> Result<Form> {
            let mut part = Part::bytes(file.bytes.clone()).file_name(file.filename.clone());
            if !file.content_type.is_empty() {
                part = part
                    .mime_str(&file.content_type)
                    .map_err(|e| ScanError::Transport(format!("Invalid content type: {}", e)))?;
            }
            Ok(Form::new().part("file", part))
        }
    }

    #[async_trait]
    impl AnalysisService for HttpAnalysisService {
        async fn analyze(&self, file: &FileBlob) -> Result<AnalyzeResponse> {
            debug!(
                "Uploading {} ({} bytes) to {}",
                file.filename,
                file.size(),
                self.endpoint
            );

            let form = Self::build_form(file)?;
            let response = self
                .client
                .post(&self.endpoint)
                .multipart(form)
                .send()
                .await
                .map_err(|e| ScanError::Transport(e.to_string()))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ScanError::Transport(e.to_string()))?;

            if !status.is_success() {
                warn!("Analysis service returned {} for {}", status, file.filename);
                return Err(ScanError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }

            serde_json::from_str(&body).map_err(|e| ScanError::MalformedResponse(e.to_string()))
        }
    }
}
