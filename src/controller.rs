//! Controller-facing public API (spec §6): thin, typed wrappers around
//! [`WorkerProxy::send`] / [`WorkerProxy::send_stream`] that pick the right
//! per-operation deadline and turn the worker's JSON payload back into the
//! typed result each operation promises. No business logic lives here — it
//! all runs worker-side (`crate::worker`) behind the correlation-id wire
//! protocol; this module only exists because the spec draws the line between
//! "core API" and "transport" at this boundary (§6, non-goal: the HTTP/SSE
//! transport that fronts the core is someone else's module).

use crate::bridge::proxy::{StreamEvent, WorkerProxy, CONTROL_TIMEOUT, DOWNLOAD_TIMEOUT, GENERATION_TIMEOUT};
use crate::envelope::{Command, CorrelationId};
use crate::error::{CoreError, CoreResult};
use crate::types::{
    ChatMessage, EffectiveSettings, GenerationOptions, GenerationResult, ModelDescriptor, ModelLoadingSettings,
    ModelRuntimeSnapshot, StopReason,
};

/// Public entry point a host process (HTTP server, desktop shell, CLI) talks
/// to. Cheap to clone; all state lives in the shared [`WorkerProxy`].
#[derive(Clone)]
pub struct Controller {
    proxy: WorkerProxy,
}

impl Controller {
    pub async fn connect() -> CoreResult<Self> {
        let proxy = WorkerProxy::spawn().await?;
        Ok(Self { proxy })
    }

    pub fn from_proxy(proxy: WorkerProxy) -> Self {
        Self { proxy }
    }

    pub async fn get_local_models(&self) -> CoreResult<Vec<ModelDescriptor>> {
        let data = self.proxy.send(Command::GetLocalModels, CONTROL_TIMEOUT).await?;
        serde_json::from_value(data).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    pub async fn load_model(&self, model_id_or_name: impl Into<String>, thread_id: Option<String>) -> CoreResult<()> {
        self.proxy
            .send(Command::LoadModel { model_id_or_name: model_id_or_name.into(), thread_id }, CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn unload_model(&self, model_id: impl Into<String>) -> CoreResult<()> {
        self.proxy.send(Command::UnloadModel { model_id: model_id.into() }, CONTROL_TIMEOUT).await?;
        Ok(())
    }

    pub async fn generate_response(
        &self,
        model_id_or_name: impl Into<String>,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
    ) -> CoreResult<GenerationResult> {
        let command = Command::GenerateResponse { model_id_or_name: model_id_or_name.into(), messages, options };
        let data = self.proxy.send(command, GENERATION_TIMEOUT).await?;
        serde_json::from_value(data).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    /// Starts a streaming generation. Returns the correlation id (pass to
    /// [`Controller::abort_generation`] to cancel) and a receiver yielding
    /// chunks in order, terminated by exactly one `Done`/`Error` event
    /// (spec §6, `generateStreamResponse`).
    pub async fn generate_stream_response(
        &self,
        model_id_or_name: impl Into<String>,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
    ) -> CoreResult<(CorrelationId, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>)> {
        let command = Command::GenerateStreamResponse { model_id_or_name: model_id_or_name.into(), messages, options };
        self.proxy.send_stream(command, GENERATION_TIMEOUT).await
    }

    pub async fn abort_generation(&self, target_id: CorrelationId) {
        self.proxy.abort(target_id).await;
    }

    pub async fn set_model_settings(&self, model_id: impl Into<String>, settings: ModelLoadingSettings) -> CoreResult<()> {
        self.proxy
            .send(Command::SetModelSettings { model_id: model_id.into(), settings }, CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn get_model_settings(&self, model_id: impl Into<String>) -> CoreResult<EffectiveSettings> {
        let data = self.proxy.send(Command::GetModelSettings { model_id: model_id.into() }, CONTROL_TIMEOUT).await?;
        serde_json::from_value(data).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    pub async fn calculate_optimal_settings(
        &self,
        model_id: impl Into<String>,
        requested: ModelLoadingSettings,
    ) -> CoreResult<EffectiveSettings> {
        let data = self
            .proxy
            .send(Command::CalculateOptimalSettings { model_id: model_id.into(), requested }, CONTROL_TIMEOUT)
            .await?;
        serde_json::from_value(data).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    pub async fn get_model_runtime_info(&self, model_id: impl Into<String>) -> CoreResult<ModelRuntimeSnapshot> {
        let data = self.proxy.send(Command::GetModelRuntimeInfo { model_id: model_id.into() }, CONTROL_TIMEOUT).await?;
        serde_json::from_value(data).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }

    pub async fn clear_context_size_cache(&self) -> CoreResult<()> {
        self.proxy.send(Command::ClearContextSizeCache, CONTROL_TIMEOUT).await?;
        Ok(())
    }

    /// `cancelDownload` / `getDownloadProgress` (spec §6) belong to the
    /// model-discovery/download collaborator, an explicit non-goal of this
    /// core (spec §1) — specified here only as the interface a host wires
    /// up, never implemented against the worker.
    pub async fn cancel_download(&self, _filename: &str) -> CoreResult<bool> {
        Err(CoreError::ResourceUnavailable("download management is provided by an external collaborator".into()))
    }

    pub async fn get_download_progress(&self, _filename: &str) -> CoreResult<f32> {
        let _ = DOWNLOAD_TIMEOUT;
        Err(CoreError::ResourceUnavailable("download management is provided by an external collaborator".into()))
    }

    pub fn is_alive(&self) -> bool {
        self.proxy.is_alive()
    }

    pub fn is_dead(&self) -> bool {
        self.proxy.is_dead()
    }

    pub async fn shutdown(&self) {
        self.proxy.terminate().await;
    }
}

/// Drains a stream started by [`Controller::generate_stream_response`] into
/// one accumulated [`GenerationResult`], for callers that don't need
/// per-chunk delivery (e.g. tests, or a host building its own SSE framing
/// independently).
pub async fn collect_stream(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
) -> CoreResult<GenerationResult> {
    let mut content = String::new();
    loop {
        match rx.recv().await {
            Some(StreamEvent::Chunk(chunk)) => content.push_str(&chunk),
            Some(StreamEvent::Done) => {
                return Ok(GenerationResult {
                    content: content.clone(),
                    tokens_generated: content.chars().count() as u64,
                    stop_reason: StopReason::EndOfSequence,
                })
            }
            Some(StreamEvent::Error(e)) => return Err(e),
            None => return Err(CoreError::WorkerCrashed),
        }
    }
}
