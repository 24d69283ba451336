//! Worker process entry point (spec §3, §4.1, §5).
//!
//! Runs as a child process spawned by the controller via
//! [`crate::bridge::process_manager::ProcessManager`]. Reads one JSON
//! envelope per line from stdin, dispatches it against the loader,
//! registry, planner, and response generator, and writes JSON envelopes to
//! stdout. All diagnostic logging goes to stderr (inherited by the parent),
//! matching the teacher's `run_worker`, whose thread layout (stdin reader /
//! main dispatch loop / a dedicated thread per in-flight generation) this
//! module keeps, adapted to `tokio` tasks instead of raw OS threads and to
//! the full command surface spec §4.1 names instead of the teacher's
//! five-command subset.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::abort::AbortRegistry;
use crate::backend::InferenceBackend;
use crate::collaborators::{ModelDiscovery, SettingsStore};
use crate::envelope::{decode, encode, Command, CorrelationId, Request, Response, ResponseBody};
use crate::error::CoreError;
use crate::generation::{ResponseGenerator, ToolBridge, TOOL_EXECUTE_TIMEOUT, TOOL_LIST_TIMEOUT};
use crate::loader::ModelLoader;
use crate::planner::ResourcePlanner;
use crate::registry::ModelRegistry;
use crate::session::SessionManager;
use crate::types::{ModelLoadingSettings, StopReason, ToolDescriptor};

enum ToolReply {
    Tools(Vec<ToolDescriptor>),
    ExecResult(Result<serde_json::Value, String>),
}

/// Worker-side `ToolBridge`: posts `mcpToolsRequest`/`executeMCPTool`
/// envelopes to stdout with a fresh correlation id and blocks (on whatever
/// thread calls it — always a `spawn_blocking` thread here, never the
/// stdin-reading task) until the matching reply envelope arrives on stdin,
/// per spec §4.7.
struct WorkerToolBridge {
    out_tx: mpsc::UnboundedSender<Response>,
    pending: StdMutex<HashMap<CorrelationId, std::sync::mpsc::Sender<ToolReply>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl WorkerToolBridge {
    fn new(out_tx: mpsc::UnboundedSender<Response>) -> Self {
        Self { out_tx, pending: StdMutex::new(HashMap::new()), next_id: std::sync::atomic::AtomicU64::new(1) }
    }

    fn next_id(&self) -> CorrelationId {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Called from the dispatch loop when a `McpToolsResponse` /
    /// `McpToolExecutionResponse` command arrives.
    fn resolve(&self, id: CorrelationId, reply: ToolReply) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(reply);
        }
    }
}

impl ToolBridge for WorkerToolBridge {
    fn discover_tools(&self) -> Result<Vec<ToolDescriptor>, CoreError> {
        let id = self.next_id();
        let (tx, rx) = std::sync::mpsc::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let _ = self.out_tx.send(Response { id, body: ResponseBody::McpToolsRequest });

        match rx.recv_timeout(TOOL_LIST_TIMEOUT) {
            Ok(ToolReply::Tools(tools)) => Ok(tools),
            Ok(ToolReply::ExecResult(_)) => Err(CoreError::InvalidPayload("expected tool list, got exec result".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(CoreError::Timeout)
            }
        }
    }

    fn execute_tool(&self, tool: &str, params: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let id = self.next_id();
        let (tx, rx) = std::sync::mpsc::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let _ = self
            .out_tx
            .send(Response { id, body: ResponseBody::ExecuteMcpTool { tool: tool.to_string(), params } });

        match rx.recv_timeout(TOOL_EXECUTE_TIMEOUT) {
            Ok(ToolReply::ExecResult(Ok(value))) => Ok(value),
            Ok(ToolReply::ExecResult(Err(message))) => Err(CoreError::BackendError(message)),
            Ok(ToolReply::Tools(_)) => Err(CoreError::InvalidPayload("expected exec result, got tool list".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(CoreError::Timeout)
            }
        }
    }
}

pub struct Worker {
    discovery: Arc<dyn ModelDiscovery>,
    loader: Arc<ModelLoader>,
    registry: Arc<ModelRegistry>,
    planner: Arc<ResourcePlanner>,
    settings: Arc<dyn SettingsStore>,
    generator: Arc<ResponseGenerator>,
    abort_registry: Arc<AbortRegistry>,
    tool_bridge: Arc<WorkerToolBridge>,
    os: String,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<dyn ModelDiscovery>,
        settings: Arc<dyn SettingsStore>,
        planner: Arc<ResourcePlanner>,
        backend: Arc<dyn InferenceBackend>,
        out_tx: mpsc::UnboundedSender<Response>,
        os: impl Into<String>,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let sessions = Arc::new(SessionManager::new());
        let loader = Arc::new(ModelLoader::new(
            discovery.clone(),
            settings.clone(),
            planner.clone(),
            backend.clone(),
            registry.clone(),
            sessions.clone(),
        ));
        let generator = Arc::new(ResponseGenerator::new(backend, registry.clone(), sessions.clone()));
        let abort_registry = Arc::new(AbortRegistry::new());
        let tool_bridge = Arc::new(WorkerToolBridge::new(out_tx));

        Self { discovery, loader, registry, planner, settings, generator, abort_registry, tool_bridge, os: os.into() }
    }

    /// Runs the dispatch loop against `stdin`, forever, writing responses
    /// through `out_tx`. Never returns normally except on `Shutdown` or
    /// stdin closing (parent died).
    pub async fn run(self: Arc<Self>, stdin: tokio::io::Stdin, out_tx: mpsc::UnboundedSender<Response>) {
        log::info!("worker ready (pid={})", std::process::id());
        let mut lines = BufReader::new(stdin).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) if !l.trim().is_empty() => l,
                Ok(Some(_)) => continue,
                Ok(None) => {
                    log::warn!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    log::warn!("stdin read error: {e}");
                    break;
                }
            };

            let request: Request = match decode(&line) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("failed to parse command: {e}");
                    let _ = out_tx.send(Response::err(0, format!("invalid payload: {e}")));
                    continue;
                }
            };

            if matches!(request.command, Command::Shutdown) {
                let _ = out_tx.send(Response::ok(request.id, None));
                self.abort_registry.finish(request.id);
                break;
            }

            let worker = self.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move { worker.dispatch(request, out_tx).await });
        }

        log::info!("worker exiting");
    }

    async fn dispatch(self: Arc<Self>, request: Request, out_tx: mpsc::UnboundedSender<Response>) {
        let id = request.id;

        // A message whose payload fails structural validation is replied to
        // with a typed error envelope — never fatal to the worker (spec
        // §4.1 failure model). `serde`'s tagged-union decode already
        // rejects malformed envelopes before we get here; what's left to
        // validate is business-level (e.g. unknown model id), handled by
        // each arm's own `CoreError`.
        match request.command {
            Command::Init => {
                let _ = out_tx.send(Response::ok(id, None));
            }

            Command::LoadModel { model_id_or_name, thread_id } => {
                let result = self.loader.load_model(&model_id_or_name, thread_id).await;
                send_result(&out_tx, id, result);
            }

            Command::UnloadModel { model_id } => {
                let result = self.loader.unload(&model_id);
                send_result(&out_tx, id, result);
            }

            Command::DeleteModel { model_id } => {
                // Filesystem deletion is an explicit non-goal; this core
                // only guarantees the model is unloaded first.
                let result = self.loader.unload(&model_id);
                send_result(&out_tx, id, result);
            }

            Command::GetLocalModels => {
                send_json(&out_tx, id, &self.discovery.list());
            }

            Command::GenerateResponse { model_id_or_name, messages, options } => {
                self.run_generate(id, model_id_or_name, messages, options, false, out_tx).await;
            }

            Command::GenerateStreamResponse { model_id_or_name, messages, options } => {
                self.run_generate(id, model_id_or_name, messages, options, true, out_tx).await;
            }

            Command::AbortGeneration { target_id } => {
                self.abort_registry.abort(target_id);
                // Fire-and-forget per spec §4.1; no terminal envelope for
                // this control id itself.
            }

            Command::SetModelSettings { model_id, settings } => {
                self.settings.save(&model_id, settings);
                let _ = out_tx.send(Response::ok(id, None));
            }

            Command::GetModelSettings { model_id } => {
                // spec §8: result is "settings merged over computed
                // defaults", so this routes through the planner exactly like
                // `CalculateOptimalSettings`, just with the stored override
                // (if any) as the requested input instead of a fresh one.
                let requested = self.settings.load(&model_id).unwrap_or_default();
                self.handle_calculate_optimal(id, &model_id, requested, &out_tx);
            }

            Command::CalculateOptimalSettings { model_id, requested } => {
                self.handle_calculate_optimal(id, &model_id, requested, &out_tx);
            }

            Command::GetModelRuntimeInfo { model_id } => match self.registry.snapshot(&model_id, &self.os) {
                Some(snapshot) => send_json(&out_tx, id, &snapshot),
                None => {
                    let _ = out_tx.send(Response::err(id, CoreError::NotLoaded(model_id).to_wire()));
                }
            },

            Command::ClearContextSizeCache => {
                self.planner.clear_context_size_cache();
                let _ = out_tx.send(Response::ok(id, None));
            }

            Command::McpToolsResponse { tools } => {
                self.tool_bridge.resolve(id, ToolReply::Tools(tools));
            }

            Command::McpToolExecutionResponse { result } => {
                self.tool_bridge.resolve(id, ToolReply::ExecResult(result));
            }

            Command::Shutdown => unreachable!("handled in the dispatch loop"),
        }
    }

    fn handle_calculate_optimal(
        &self,
        id: CorrelationId,
        model_id: &str,
        requested: ModelLoadingSettings,
        out_tx: &mpsc::UnboundedSender<Response>,
    ) {
        let Some(descriptor) = self.loader_descriptor(model_id) else {
            let _ = out_tx.send(Response::err(id, CoreError::NotFound(model_id.to_string()).to_wire()));
            return;
        };
        match self.planner.plan(&descriptor, requested) {
            Ok(effective) => send_json(out_tx, id, &effective),
            Err(err) => {
                let _ = out_tx.send(Response::err(id, err.to_wire()));
            }
        }
    }

    fn loader_descriptor(&self, model_id: &str) -> Option<crate::types::ModelDescriptor> {
        self.discovery.resolve(model_id)
    }

    async fn run_generate(
        self: Arc<Self>,
        id: CorrelationId,
        model_id_or_name: String,
        messages: Vec<crate::types::ChatMessage>,
        options: crate::types::GenerationOptions,
        streaming: bool,
        out_tx: mpsc::UnboundedSender<Response>,
    ) {
        if let Err(err) = self.loader.load_model(&model_id_or_name, options.thread_id.clone()).await {
            let _ = out_tx.send(Response::err(id, err.to_wire()));
            return;
        }

        let cancel = self.abort_registry.begin(id);
        let generator = self.generator.clone();
        let tool_bridge = self.tool_bridge.clone();
        let abort_registry = self.abort_registry.clone();
        let model_id = model_id_or_name;

        // The backend call blocks the calling thread for the whole
        // generation (spec §5): run it on a blocking-pool thread so the
        // stdin dispatch loop stays free to observe `abortGeneration`.
        tokio::task::spawn_blocking(move || {
            let result = if streaming {
                let out_tx_chunks = out_tx.clone();
                generator.generate_stream(&model_id, &messages, &options, cancel, Some(tool_bridge.as_ref()), &mut |chunk| {
                    let _ = out_tx_chunks.send(Response::stream_chunk(id, chunk));
                })
            } else {
                generator.generate(&model_id, &messages, &options, cancel, Some(tool_bridge.as_ref()))
            };

            abort_registry.finish(id);

            match result {
                // spec §4.1 sendStream: an aborted stream terminates with an
                // abort error, not a plain `STREAM_COMPLETE` success.
                Ok(generation_result) if streaming && generation_result.stop_reason == StopReason::Abort => {
                    let _ = out_tx.send(Response::err(id, CoreError::Abort.to_wire()));
                }
                Ok(_) if streaming => {
                    let _ = out_tx.send(Response::stream_complete(id));
                }
                Ok(generation_result) => send_json(&out_tx, id, &generation_result),
                Err(err) => {
                    let _ = out_tx.send(Response::err(id, err.to_wire()));
                }
            }
        });
    }
}

fn send_result(out_tx: &mpsc::UnboundedSender<Response>, id: CorrelationId, result: Result<(), CoreError>) {
    match result {
        Ok(()) => {
            let _ = out_tx.send(Response::ok(id, None));
        }
        Err(err) => {
            let _ = out_tx.send(Response::err(id, err.to_wire()));
        }
    }
}

fn send_json<T: serde::Serialize>(out_tx: &mpsc::UnboundedSender<Response>, id: CorrelationId, value: &T) {
    match serde_json::to_value(value) {
        Ok(json) => {
            let _ = out_tx.send(Response::ok(id, Some(json)));
        }
        Err(e) => {
            let _ = out_tx.send(Response::err(id, format!("serialize error: {e}")));
        }
    }
}

/// Drains `out_rx` and writes each response as one JSON-lines record to
/// stdout, flushing immediately (spec §4.1 ordering guarantee: envelopes
/// are delivered in send order on each direction).
pub async fn stdout_writer_task(mut out_rx: mpsc::UnboundedReceiver<Response>) {
    let mut stdout = std::io::stdout();
    while let Some(response) = out_rx.recv().await {
        match encode(&response) {
            Ok(line) => {
                if write!(stdout, "{line}").is_err() || stdout.flush().is_err() {
                    log::warn!("failed to write to stdout, parent likely gone");
                    break;
                }
            }
            Err(e) => log::warn!("failed to serialize response: {e}"),
        }
    }
}

/// Entry point called from `main.rs` when launched with `--worker`.
pub async fn run(
    discovery: Arc<dyn ModelDiscovery>,
    settings: Arc<dyn SettingsStore>,
    planner: Arc<ResourcePlanner>,
    backend: Arc<dyn InferenceBackend>,
    os: impl Into<String>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(stdout_writer_task(out_rx));

    let worker = Arc::new(Worker::new(discovery, settings, planner, backend, out_tx.clone(), os));
    worker.run(tokio::io::stdin(), out_tx).await;

    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::MockBackend;
    use crate::collaborators::{HostSystemInfo, InMemoryCatalog, JsonFileSettingsStore};
    use crate::types::ModelDescriptor;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            display_name: id.to_string(),
            filename: format!("{id}.gguf"),
            path: format!("/m/{id}.gguf"),
            size_bytes: 1024,
            layer_count: Some(32),
            trained_context_length: Some(4096),
            max_context_length: Some(4096),
            param_count: None,
            quantization: None,
        }
    }

    fn test_worker() -> (Arc<Worker>, mpsc::UnboundedSender<Response>, mpsc::UnboundedReceiver<Response>) {
        let catalog = Arc::new(InMemoryCatalog::new(vec![descriptor("model1")]));
        let settings: Arc<dyn SettingsStore> =
            Arc::new(JsonFileSettingsStore::new(std::env::temp_dir().join(format!("worker-test-{:p}", &catalog))));
        let planner = Arc::new(ResourcePlanner::new(Arc::new(HostSystemInfo)));
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Response>();
        // `Worker::new` only wires this sender to the tool-bridge reverse
        // channel; dispatch() replies are written to whatever out_tx each
        // call is given, so tests must thread a clone of the same sender
        // through both to observe replies on `out_rx`.
        let worker = Arc::new(Worker::new(catalog, settings, planner, backend, out_tx.clone(), "linux"));
        (worker, out_tx, out_rx)
    }

    #[tokio::test]
    async fn init_is_acknowledged() {
        let (worker, out_tx, mut out_rx) = test_worker();
        worker.dispatch(Request { id: 1, command: Command::Init }, out_tx).await;
        let response = out_rx.recv().await.unwrap();
        assert_eq!(response.id, 1);
        assert!(matches!(response.body, ResponseBody::Terminal { success: true, .. }));
    }

    #[tokio::test]
    async fn get_local_models_lists_the_discovery_catalog() {
        let (worker, out_tx, mut out_rx) = test_worker();
        worker.dispatch(Request { id: 1, command: Command::GetLocalModels }, out_tx).await;
        let response = out_rx.recv().await.unwrap();
        match response.body {
            ResponseBody::Terminal { success: true, data: Some(data), .. } => {
                assert_eq!(data.as_array().unwrap().len(), 1);
                assert_eq!(data[0]["id"], "model1");
            }
            other => panic!("unexpected response body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_model_settings_merges_stored_override_over_computed_defaults() {
        let (worker, out_tx, mut out_rx) = test_worker();
        worker
            .clone()
            .dispatch(
                Request {
                    id: 1,
                    command: Command::SetModelSettings {
                        model_id: "model1".into(),
                        settings: ModelLoadingSettings { temperature: Some(0.1), ..Default::default() },
                    },
                },
                out_tx.clone(),
            )
            .await;
        let _ = out_rx.recv().await.unwrap();

        worker.dispatch(Request { id: 2, command: Command::GetModelSettings { model_id: "model1".into() } }, out_tx).await;
        let response = out_rx.recv().await.unwrap();
        match response.body {
            ResponseBody::Terminal { success: true, data: Some(data), .. } => {
                assert_eq!(data["temperature"], 0.1);
                assert!(data["context_size"].as_u64().unwrap() > 0);
            }
            other => panic!("unexpected response body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_then_generate_round_trips_through_envelopes() {
        let (worker, out_tx, mut out_rx) = test_worker();
        worker
            .clone()
            .dispatch(
                Request { id: 1, command: Command::LoadModel { model_id_or_name: "model1".into(), thread_id: None } },
                out_tx.clone(),
            )
            .await;
        // Drain the LoadModel terminal envelope before looking for the
        // generation's reply on the same channel.
        let _ = out_rx.recv().await.unwrap();

        let messages = vec![crate::types::ChatMessage { role: "user".into(), content: "hi".into() }];
        worker
            .clone()
            .dispatch(
                Request {
                    id: 2,
                    command: Command::GenerateResponse {
                        model_id_or_name: "model1".into(),
                        messages,
                        options: crate::types::GenerationOptions::default(),
                    },
                },
                out_tx,
            )
            .await;

        let response = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await.unwrap().unwrap();
        assert_eq!(response.id, 2);
        match response.body {
            ResponseBody::Terminal { success: true, data: Some(data), .. } => {
                assert_eq!(data["content"], "echo: hi");
            }
            other => panic!("unexpected response body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_runtime_info_is_not_loaded() {
        let (worker, out_tx, mut out_rx) = test_worker();
        worker.dispatch(Request { id: 3, command: Command::GetModelRuntimeInfo { model_id: "nope".into() } }, out_tx).await;
        let response = out_rx.recv().await.unwrap();
        assert!(matches!(response.body, ResponseBody::Terminal { success: false, .. }));
    }
}
