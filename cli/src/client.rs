//! HTTP client for a running `zimage serve`

use reqwest::Client;
use std::time::Duration;
use zimage_core::api::{ErrorResponse, GenerateBody, GenerateResponse, StatusResponse};
use zimage_core::{Error, Result};

/// Generation on a GPU can take minutes on a busy queue.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ImageClient {
    http: Client,
    base_url: String,
}

impl ImageClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection {
                url: base_url.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn generate(&self, body: &GenerateBody) -> Result<GenerateResponse> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::decode(response).await
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let url = format!("{}/status", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::decode(response).await
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        let message = if err.is_connect() {
            "server is not running (start it with `zimage serve`)".to_string()
        } else if err.is_timeout() {
            format!("request timed out after {}s", REQUEST_TIMEOUT.as_secs())
        } else {
            err.to_string()
        };
        Error::Connection {
            url: self.base_url.clone(),
            message,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Server {
            status: status.as_u16(),
            message: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|body| format!("{} ({})", body.error.message, body.error.r#type))
                .unwrap_or(text);
            return Err(Error::Server {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|e| Error::Server {
            status: status.as_u16(),
            message: format!("unexpected response: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zimage_core::config::GenerationConfig;
    use zimage_core::{ArtifactWriter, GenerationRequest};
    use zimage_daemon::AppState;
    use zimage_runtime_api::{Backend, DeviceProfile, Precision};
    use zimage_runtime_diffusion::testing::{MockEngineState, MockLoader};
    use zimage_runtime_diffusion::DiffusionRuntime;

    async fn spawn_server(loaded: bool, dir: &std::path::Path) -> String {
        let profile = DeviceProfile {
            backend: Backend::Cpu,
            precision: Precision::F32,
        };
        let runtime = Arc::new(DiffusionRuntime::new("test/model", profile, 4));
        if loaded {
            runtime
                .load(Arc::new(MockLoader::new(MockEngineState::new())))
                .await
                .unwrap();
        }
        let state = Arc::new(AppState::new(
            runtime,
            ArtifactWriter::new(dir, "img"),
            GenerationConfig::default(),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, zimage_daemon::api::routes(state))
                .await
                .unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn generates_through_server() {
        let dir = tempfile::tempdir().unwrap();
        let client = ImageClient::new(spawn_server(true, dir.path()).await).unwrap();

        let defaults = GenerationConfig::default();
        let mut request = GenerationRequest::new("sunset over mountains", &defaults);
        request.seed = Some(42);
        let response = client.generate(&GenerateBody::from(&request)).await.unwrap();

        assert_eq!(response.status, "success");
        assert_eq!(response.meta.seed, 42);
        assert!(response.image_path.to_str().unwrap().ends_with("_42.png"));
    }

    #[tokio::test]
    async fn failure_status_becomes_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ImageClient::new(spawn_server(false, dir.path()).await).unwrap();

        let request = GenerationRequest::new("p", &GenerationConfig::default());
        match client.generate(&GenerateBody::from(&request)).await {
            Err(Error::Server { status, message }) => {
                assert_eq!(status, 503);
                assert!(message.contains("model_not_ready"));
            }
            other => panic!("expected server error, got {:?}", other.map(|r| r.status)),
        }
    }

    #[tokio::test]
    async fn status_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = ImageClient::new(spawn_server(true, dir.path()).await).unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.status, "ready");
        assert_eq!(status.backend, "cpu");
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ImageClient::new(format!("http://{}/", addr)).unwrap();
        assert_eq!(client.base_url(), format!("http://{}", addr));

        let err = client.status().await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert!(err.to_string().contains("zimage serve"));
    }
}
