//! The single function the voice model is allowed to call.
//!
//! Every model-initiated tool invocation goes through `/chat/orchestrator`,
//! whatever name the model used, so the tool set can change on the backend
//! without renegotiating the session.

use chrono::Utc;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::BackendClient;
use crate::context::{ConversationHistory, SessionContext, ToolInvocation};
use crate::protocol::OrchestratorRequest;

pub const BRIDGE_FUNCTION_NAME: &str = "execute_tool";

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeArguments {
    #[schemars(description = "Name of the backend tool to run, for example search_use_cases.")]
    pub tool_name: String,
    #[schemars(
        description = "Arguments for the tool as a JSON object.",
        with = "serde_json::Map<String, Value>"
    )]
    #[serde(default)]
    pub payload: Value,
}

/// A function definition in the shape the realtime session expects.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

pub fn bridge_tool_definition() -> FunctionDefinition {
    let mut parameters =
        serde_json::to_value(schema_for!(BridgeArguments)).unwrap_or_else(|_| json!({}));
    if let Some(object) = parameters.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }

    FunctionDefinition {
        kind: "function",
        name: BRIDGE_FUNCTION_NAME,
        description: "Run a backend tool. Use this for anything that needs data about use cases, \
                      initiatives or documents, or to create and update them.",
        parameters,
    }
}

/// A complete function call from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// A call with its backend request already built, ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub call_id: String,
    request: OrchestratorRequest,
}

impl PreparedCall {
    pub fn tool_name(&self) -> &str {
        &self.request.tool_name
    }

    pub fn payload(&self) -> &Value {
        &self.request.payload
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub call_id: String,
    pub tool_name: String,
    /// What goes back to the model as the function output.
    pub output: Value,
    record: Option<ToolInvocation>,
}

impl BridgeOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.is_some()
    }

    /// Appends a successful call to the session context. Failures leave it untouched.
    pub fn record_into(&self, context: &mut SessionContext) {
        if let Some(record) = &self.record {
            context.record(record.clone());
        }
    }

    pub fn output_json(&self) -> String {
        self.output.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionBridge {
    client: BackendClient,
    domain_id: Option<String>,
}

impl FunctionBridge {
    pub fn new(client: BackendClient, domain_id: Option<String>) -> Self {
        Self { client, domain_id }
    }

    /// Snapshots the session state into a backend request.
    pub fn prepare(
        &self,
        call: &FunctionCall,
        context: &SessionContext,
        last_user_utterance: &str,
        history: &ConversationHistory,
    ) -> PreparedCall {
        let (tool_name, payload) = resolve_tool(call);
        PreparedCall {
            call_id: call.call_id.clone(),
            request: OrchestratorRequest {
                tool_name,
                payload,
                session_context: context.to_payload(),
                domain_id: self.domain_id.clone(),
                user_query: last_user_utterance.to_string(),
                conversation_history: history.to_vec(),
            },
        }
    }

    /// Runs a prepared call. Never fails: errors become an error payload for the model.
    pub async fn execute(&self, prepared: PreparedCall) -> BridgeOutcome {
        let PreparedCall { call_id, request } = prepared;
        let tool_name = request.tool_name.clone();

        let failure = |message: String| BridgeOutcome {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            output: json!({ "ok": false, "error": message }),
            record: None,
        };

        match self.client.orchestrate(&request).await {
            Ok(response) if response.ok => {
                tracing::info!(
                    tool = %tool_name,
                    iterations = ?response.iterations,
                    execution_time_ms = ?response.execution_time_ms,
                    "bridge call succeeded"
                );
                BridgeOutcome {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    output: response.result.clone(),
                    record: Some(ToolInvocation {
                        tool_name: tool_name.clone(),
                        payload: request.payload,
                        result: response.result,
                        timestamp: Utc::now(),
                    }),
                }
            }
            Ok(response) => {
                let message = response
                    .error
                    .unwrap_or_else(|| format!("tool {tool_name} failed"));
                tracing::warn!(tool = %tool_name, error = %message, "bridge call reported failure");
                failure(message)
            }
            Err(err) => {
                tracing::warn!(tool = %tool_name, error = %err, "bridge call failed");
                failure(err.to_string())
            }
        }
    }

    pub async fn invoke(
        &self,
        call: &FunctionCall,
        context: &SessionContext,
        last_user_utterance: &str,
        history: &ConversationHistory,
    ) -> BridgeOutcome {
        let prepared = self.prepare(call, context, last_user_utterance, history);
        self.execute(prepared).await
    }
}

/// Works out which backend tool a call targets and with what payload.
///
/// Arguments that are not valid JSON are forwarded as `{"raw": ...}`.
pub(crate) fn resolve_tool(call: &FunctionCall) -> (String, Value) {
    let parsed = if call.arguments.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(&call.arguments)
    };

    let parsed = match parsed {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(function = %call.name, error = %err, "forwarding raw arguments");
            return (call.name.clone(), json!({ "raw": call.arguments }));
        }
    };

    if call.name == BRIDGE_FUNCTION_NAME {
        if let Ok(arguments) = serde_json::from_value::<BridgeArguments>(parsed.clone()) {
            let payload = if arguments.payload.is_null() {
                json!({})
            } else {
                arguments.payload
            };
            return (arguments.tool_name, payload);
        }
    }

    (call.name.clone(), parsed)
}
