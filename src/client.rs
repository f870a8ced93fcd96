use crate::error::ClientError;
use crate::protocol::{
    AbortRequest, ArtifactListing, ArtifactRecord, ChatRequest, EphemeralKeyResponse,
    OrchestratorRequest, OrchestratorResponse,
};
use reqwest::Client as HttpClient;
use reqwest::header::ACCEPT;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
        }
    }
}

/// HTTP access to the orchestrator backend.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

type ClientResult<T> = Result<T, ClientError>;

impl BackendClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(format!("{}{}", self.base_url, path)))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(format!("{}{}", self.base_url, path)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Issues the streaming chat request. The caller checks the status.
    pub async fn open_chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.post("/chat/intelligent/stream")
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
    }

    pub async fn abort(&self, request_id: &str) -> ClientResult<()> {
        let request = AbortRequest {
            request_id: request_id.to_string(),
        };
        let response = self
            .post("/chat/intelligent/abort")
            .json(&request)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn orchestrate(
        &self,
        request: &OrchestratorRequest,
    ) -> ClientResult<OrchestratorResponse> {
        let response = self.post("/chat/orchestrator").json(request).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    pub async fn list_artifacts(&self) -> ClientResult<Vec<ArtifactRecord>> {
        let response = self.get("/artifacts").send().await?;
        let response = ensure_success(response).await?;
        let listing: ArtifactListing = response.json().await?;
        Ok(listing.into_records())
    }

    pub async fn ephemeral_key(&self) -> ClientResult<EphemeralKeyResponse> {
        let response = self
            .post("/realtime/ephemeral-key")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }
}

async fn ensure_success(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Api { status, body })
}

pub(crate) fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
