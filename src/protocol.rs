//! Wire types shared with the orchestrator backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::HistoryEntry;

/// Request body for `POST /chat/intelligent/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_query: String,
    #[serde(default)]
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub active_skills: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub request_id: String,
}

/// One decoded frame of the text stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking {
        #[serde(default)]
        message: Option<String>,
    },
    ThinkingContent {
        #[serde(default)]
        content: String,
    },
    Status {
        #[serde(default)]
        message: String,
        #[serde(default)]
        stage: Option<String>,
    },
    ToolCall {
        #[serde(alias = "function")]
        name: String,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        iteration: Option<u32>,
    },
    ToolResult {
        #[serde(default, alias = "function")]
        name: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        success: Option<bool>,
    },
    Text {
        #[serde(default)]
        content: String,
    },
    Done {
        #[serde(default)]
        response: String,
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default, alias = "skillsUsed")]
        skills: Vec<String>,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default)]
        artifacts: Vec<ArtifactReference>,
    },
    Error {
        #[serde(alias = "error")]
        message: String,
    },
    SessionStarted {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    Interrupted {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default, rename = "partialResponse")]
        partial_response: Option<String>,
        #[serde(default)]
        artifacts: Vec<ArtifactReference>,
    },
    PermissionRequest {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "toolName")]
        tool: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Pointer to a server-owned file. The client never holds artifact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReference {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub download_url: String,
}

/// One entry of `GET /artifacts`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "fileName")]
    pub file_name: String,
    #[serde(default, alias = "downloadUrl", alias = "url")]
    pub download_url: String,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<ArtifactRecord> for ArtifactReference {
    fn from(record: ArtifactRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            title: record.title,
            file_name: record.file_name,
            download_url: record.download_url,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ArtifactListing {
    Bare(Vec<ArtifactRecord>),
    Wrapped { artifacts: Vec<ArtifactRecord> },
}

impl ArtifactListing {
    pub(crate) fn into_records(self) -> Vec<ArtifactRecord> {
        match self {
            ArtifactListing::Bare(records) => records,
            ArtifactListing::Wrapped { artifacts } => artifacts,
        }
    }
}

/// Request body for `POST /chat/orchestrator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRequest {
    pub tool_name: String,
    pub payload: Value,
    pub session_context: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    pub user_query: String,
    pub conversation_history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

/// Short-lived credential for the realtime socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EphemeralKeyResponse {
    ClientSecret { client_secret: ClientSecret },
    Flat {
        key: String,
        #[serde(default, rename = "expiresAt")]
        expires_at: Option<i64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl EphemeralKeyResponse {
    pub fn key(&self) -> &str {
        match self {
            EphemeralKeyResponse::ClientSecret { client_secret } => &client_secret.value,
            EphemeralKeyResponse::Flat { key, .. } => key,
        }
    }
}
