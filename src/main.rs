//! Process entry point. The same binary plays both roles in the
//! controller/worker bridge (spec §4.1): launched normally it is the
//! controller and spawns itself with `--worker` to become the worker side.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, LevelFilter};

use llama_core::backend::{InferenceBackend, MockBackend};
use llama_core::collaborators::{HostSystemInfo, JsonFileSettingsStore, ModelDiscovery, SettingsStore};
use llama_core::planner::ResourcePlanner;
use llama_core::types::{ChatMessage, GenerationOptions};
use llama_core::worker;
use llama_core::Controller;

mod discovery;

use discovery::DirectoryModelDiscovery;

fn settings_path() -> PathBuf {
    std::env::var("LLAMA_CORE_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("llama-core-settings.json"))
}

fn model_dir() -> PathBuf {
    std::env::var("LLAMA_CORE_MODEL_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

fn build_backend() -> Arc<dyn InferenceBackend> {
    #[cfg(feature = "llama-cpp")]
    {
        match llama_core::backend::llama_cpp::LlamaCppBackend::new() {
            Ok(backend) => return Arc::new(backend),
            Err(e) => error!("failed to initialize llama-cpp backend, falling back to mock: {e}"),
        }
    }
    Arc::new(MockBackend)
}

#[tokio::main]
async fn main() {
    let is_worker = std::env::args().any(|a| a == "--worker");
    llama_core::logging::init(LevelFilter::Info);

    if is_worker {
        run_worker().await;
    } else {
        run_controller_demo().await;
    }
}

async fn run_worker() {
    info!("starting worker process");
    let discovery: Arc<dyn ModelDiscovery> = Arc::new(DirectoryModelDiscovery::new(model_dir()));
    let settings: Arc<dyn SettingsStore> = Arc::new(JsonFileSettingsStore::new(settings_path()));
    let planner = Arc::new(ResourcePlanner::new(Arc::new(HostSystemInfo)));
    let backend = build_backend();

    worker::run(discovery, settings, planner, backend, std::env::consts::OS).await;
}

/// Minimal standalone demo of the controller API: spawns the worker, lists
/// models in `LLAMA_CORE_MODEL_DIR`, and runs one generation against the
/// first one found. A host embedding this core (HTTP server, desktop shell)
/// would call [`Controller`] the same way behind its own transport instead.
async fn run_controller_demo() {
    info!("starting controller process");
    let controller = match Controller::connect().await {
        Ok(c) => c,
        Err(e) => {
            error!("failed to start worker: {e}");
            std::process::exit(1);
        }
    };

    let models = match controller.get_local_models().await {
        Ok(models) => models,
        Err(e) => {
            error!("getLocalModels failed: {e}");
            controller.shutdown().await;
            return;
        }
    };

    let Some(model) = models.into_iter().next() else {
        info!("no models found under {:?}; set LLAMA_CORE_MODEL_DIR", model_dir());
        controller.shutdown().await;
        return;
    };

    if let Err(e) = controller.load_model(&model.id, None).await {
        error!("loadModel({}) failed: {e}", model.id);
        controller.shutdown().await;
        return;
    }

    let messages = vec![ChatMessage { role: "user".into(), content: "Say hello in one sentence.".into() }];
    match controller.generate_response(&model.id, messages, GenerationOptions::default()).await {
        Ok(result) => info!("generated: {:?}", result),
        Err(e) => error!("generateResponse failed: {e}"),
    }

    controller.shutdown().await;
}
