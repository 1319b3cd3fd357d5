// Handles communication with the Ollama backend

use crate::error::{RelayError, Result};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Most bytes of a backend error body carried into the relay's error message.
pub const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Serialize, Debug)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub stream: bool,
}

#[derive(Deserialize, Debug)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagEntry>,
}

#[derive(Deserialize, Debug)]
pub struct TagEntry {
    pub name: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
}

/// Raw NDJSON bytes of a generation. Dropping the stream aborts the request.
pub type GenerationStream = BoxStream<'static, reqwest::Result<Bytes>>;

#[derive(Clone, Debug)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Opens a streaming `/api/generate` call.
    ///
    /// Resolves once response headers arrive. Connection failures and
    /// non-success statuses are reported here, before any body is read.
    pub async fn generate_stream(&self, model: &str, prompt: &str) -> Result<GenerationStream> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model,
                prompt,
                stream: true,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::BackendStatus {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        Ok(response.bytes_stream().boxed())
    }

    pub async fn fetch_tags(&self) -> Result<TagsResponse> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::BackendStatus {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        response
            .json()
            .await
            .map_err(|e| RelayError::ModelListing(format!("invalid /api/tags response: {e}")))
    }
}

// Reads at most ERROR_BODY_LIMIT bytes, then drops the rest of the response.
async fn error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = ERROR_BODY_LIMIT - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&body).into_owned()
}
