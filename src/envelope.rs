//! Wire protocol between controller and worker (spec §4.1, §6).
//!
//! One JSON object per line over stdin/stdout, the same framing the teacher
//! uses for its worker IPC (`WorkerRequest`/`WorkerResponse` in the original
//! `ipc_types.rs`), generalized here to the full envelope surface the spec
//! requires: control, generation, stream chunks, progress, and the
//! worker-initiated reverse-bridge envelopes for tool discovery/execution.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, GenerationOptions, ModelLoadingSettings};

/// Correlation id. Monotonically increasing decimal strings within one
/// worker incarnation; never reused after a restart (spec §3 invariant).
pub type CorrelationId = u64;

/// Envelope sent from controller to worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: CorrelationId,
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the controller can send. Control and generation classes from
/// spec §4.1's transport contract.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    Init,
    LoadModel {
        model_id_or_name: String,
        thread_id: Option<String>,
    },
    UnloadModel {
        model_id: String,
    },
    DeleteModel {
        model_id: String,
    },
    GetLocalModels,
    GenerateResponse {
        model_id_or_name: String,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
    },
    GenerateStreamResponse {
        model_id_or_name: String,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
    },
    AbortGeneration {
        target_id: CorrelationId,
    },
    SetModelSettings {
        model_id: String,
        settings: ModelLoadingSettings,
    },
    GetModelSettings {
        model_id: String,
    },
    CalculateOptimalSettings {
        model_id: String,
        requested: ModelLoadingSettings,
    },
    GetModelRuntimeInfo {
        model_id: String,
    },
    ClearContextSizeCache,
    /// Reply to a worker-initiated `mcpToolsRequest`.
    McpToolsResponse { tools: Vec<crate::types::ToolDescriptor> },
    /// Reply to a worker-initiated `executeMCPTool`.
    McpToolExecutionResponse { result: Result<serde_json::Value, String> },
    Shutdown,
}

/// Envelope sent from worker to controller: either a reply to a `Request`
/// with the same id, a stream chunk, a progress update, or a worker-initiated
/// reverse-bridge call (distinguished from a reply because it carries an
/// originating `type`, not a `success` flag — spec §4.7).
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResponseBody {
    /// Terminal success/failure for a request (or the final envelope of a
    /// stream, where `data` is the literal `"STREAM_COMPLETE"`).
    Terminal {
        success: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
    },
    /// One chunk of an in-progress stream.
    StreamChunk { data: String },
    /// A download-progress update (surfaced by the controller API but not
    /// produced by this core; reserved for the discovery collaborator).
    DownloadProgress { filename: String, fraction: f32 },
    /// Worker → controller: list the currently available tools.
    McpToolsRequest,
    /// Worker → controller: invoke one tool by name with JSON params.
    ExecuteMcpTool { tool: String, params: serde_json::Value },
    /// Unsolicited error (e.g. an uncaught worker-side exception that must
    /// not be fatal — spec §4.1's failure model).
    Error { message: String },
}

pub const STREAM_COMPLETE: &str = "STREAM_COMPLETE";

impl Response {
    pub fn ok(id: CorrelationId, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            body: ResponseBody::Terminal { success: true, data, error: None },
        }
    }

    pub fn err(id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ResponseBody::Terminal { success: false, data: None, error: Some(message.into()) },
        }
    }

    pub fn stream_chunk(id: CorrelationId, data: impl Into<String>) -> Self {
        Self { id, body: ResponseBody::StreamChunk { data: data.into() } }
    }

    pub fn stream_complete(id: CorrelationId) -> Self {
        Self::ok(id, Some(serde_json::Value::String(STREAM_COMPLETE.to_string())))
    }
}

/// Encode an envelope as one JSON-lines record (newline-terminated).
pub fn encode<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(format!("{}\n", serde_json::to_string(value)?))
}

/// Decode one JSON-lines record.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_load_model_request() {
        let req = Request {
            id: 7,
            command: Command::LoadModel { model_id_or_name: "model1".into(), thread_id: None },
        };
        let line = encode(&req).unwrap();
        let decoded: Request = decode(&line).unwrap();
        assert_eq!(decoded.id, 7);
        matches!(decoded.command, Command::LoadModel { .. });
    }

    #[test]
    fn stream_complete_carries_sentinel() {
        let resp = Response::stream_complete(3);
        if let ResponseBody::Terminal { success, data, .. } = resp.body {
            assert!(success);
            assert_eq!(data, Some(serde_json::Value::String(STREAM_COMPLETE.to_string())));
        } else {
            panic!("expected terminal body");
        }
    }
}
