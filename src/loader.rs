//! Model loader (spec §4.3): realizes the single-loaded-model policy and the
//! atomic-load protocol via the state machine
//! `Idle → Loading → Active → Unloading → Idle` (`Loading → Idle` on
//! failure), using the registry's loading lock as the concurrency guard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::InferenceBackend;
use crate::collaborators::{ModelDiscovery, SettingsStore};
use crate::error::{CoreError, CoreResult};
use crate::planner::ResourcePlanner;
use crate::registry::{LoadClaim, ModelRegistry, RuntimeInfo};
use crate::session::SessionManager;
use crate::types::{now_ms, ModelDescriptor};

pub struct ModelLoader {
    discovery: Arc<dyn ModelDiscovery>,
    settings: Arc<dyn SettingsStore>,
    planner: Arc<ResourcePlanner>,
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ModelRegistry>,
    sessions: Arc<SessionManager>,
}

impl ModelLoader {
    pub fn new(
        discovery: Arc<dyn ModelDiscovery>,
        settings: Arc<dyn SettingsStore>,
        planner: Arc<ResourcePlanner>,
        backend: Arc<dyn InferenceBackend>,
        registry: Arc<ModelRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self { discovery, settings, planner, backend, registry, sessions }
    }

    /// Steps 1-10 of spec §4.3's load algorithm.
    pub async fn load_model(&self, model_id_or_name: &str, thread_id: Option<String>) -> CoreResult<()> {
        // Step 1: resolve against the discovery collaborator.
        let descriptor = self
            .discovery
            .resolve(model_id_or_name)
            .ok_or_else(|| CoreError::NotFound(model_id_or_name.to_string()))?;

        // Steps 2-4: check Active/Loading and claim the loading lock in one
        // atomic step, so two concurrent calls for the same model can never
        // both observe "not loading" and both start a native load.
        match self.registry.begin_load(&descriptor.id) {
            LoadClaim::AlreadyActive => {
                if let Some(tid) = &thread_id {
                    self.registry.associate_thread(&descriptor.id, tid);
                }
                self.registry.touch(&descriptor.id);
                Ok(())
            }
            LoadClaim::Waiting(notify) => {
                notify.notified().await;
                if let Some(tid) = &thread_id {
                    self.registry.associate_thread(&descriptor.id, tid);
                }
                Ok(())
            }
            LoadClaim::Claimed => {
                let result = self.load_locked(&descriptor, thread_id).await;
                // Step 10: release the lock regardless of outcome —
                // `Loading → Idle` on failure, `Loading → Active` on success
                // (registry already reflects Active by the time we get here
                // if `result` is `Ok`).
                self.registry.release_loading_lock(&descriptor.id);
                result
            }
        }
    }

    async fn load_locked(&self, descriptor: &ModelDescriptor, thread_id: Option<String>) -> CoreResult<()> {
        // Step 5: unload every other active model, serially, to honor the
        // single-loaded-model invariant. Disposal errors are logged, never
        // fatal to the new load.
        for other_id in self.registry.active_model_ids() {
            if other_id != descriptor.id {
                if let Err(err) = self.unload(&other_id) {
                    log::warn!("failed to unload {other_id} while loading {}: {err}", descriptor.id);
                }
            }
        }

        // Step 6: read persisted settings, plan effective settings.
        let user_settings = self.settings.load(&descriptor.id).unwrap_or_default();
        let effective = self.planner.plan(descriptor, user_settings)?;

        // Step 7: gpuLayers = min(effective.gpuLayers, modelInfo.layerCount)
        // when a layer count is known, else effective.gpuLayers verbatim.
        let gpu_layers = match descriptor.layer_count {
            Some(layer_count) => effective.gpu_layers.min(layer_count),
            None => effective.gpu_layers,
        };

        let started = Instant::now();
        let model = self.backend.load_model(&descriptor.path, gpu_layers)?;
        let loading_time_ms = started.elapsed().as_millis() as u64;

        // Step 8: create the context and primary session.
        let context = match self.backend.create_context(&model, effective.context_size, effective.batch_size, effective.threads)
        {
            Ok(context) => context,
            Err(err) => {
                self.backend.dispose_model(model);
                return Err(err);
            }
        };

        let session_id = SessionManager::session_id_for(&descriptor.id);
        let session = match self.backend.create_session(&context, &session_id) {
            Ok(session) => session,
            Err(err) => {
                self.backend.dispose_context(context);
                self.backend.dispose_model(model);
                return Err(err);
            }
        };
        self.sessions.create(&session_id);

        // Step 9: register in the registry.
        let mut thread_ids = HashSet::new();
        if let Some(tid) = thread_id {
            thread_ids.insert(tid);
        }
        let now = now_ms();
        self.registry.register(RuntimeInfo {
            model_id: descriptor.id.clone(),
            model_path: descriptor.path.clone(),
            model,
            context,
            session,
            context_size: effective.context_size,
            gpu_layers,
            batch_size: effective.batch_size,
            loaded_at_ms: now,
            last_used_at_ms: now,
            loading_time_ms,
            thread_ids,
        });

        Ok(())
    }

    /// Unload: look up runtime info; if absent, no-op with a warning.
    /// Otherwise dispose the session, then unregister (which yields the
    /// context and model handles to dispose, in that order). Disposal must
    /// never leak native handles; errors are logged, not propagated — the
    /// backend trait's dispose methods do not return `Result` for exactly
    /// this reason.
    pub fn unload(&self, model_id: &str) -> CoreResult<()> {
        let session_id = SessionManager::session_id_for(model_id);
        self.sessions.dispose(&session_id);

        match self.registry.unregister(model_id) {
            Some(handles) => {
                self.backend.dispose_session(handles.session);
                self.backend.dispose_context(handles.context);
                self.backend.dispose_model(handles.model);
                Ok(())
            }
            None => {
                log::warn!("unload called for model {model_id} with no runtime info");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::collaborators::{HostSystemInfo, InMemoryCatalog, JsonFileSettingsStore};

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

    fn test_loader(catalog: Arc<InMemoryCatalog>) -> (ModelLoader, Arc<ModelRegistry>) {
        test_loader_with_backend(catalog, Arc::new(MockBackend::default()))
    }

    fn test_loader_with_backend(
        catalog: Arc<InMemoryCatalog>,
        backend: Arc<dyn InferenceBackend>,
    ) -> (ModelLoader, Arc<ModelRegistry>) {
        let settings: Arc<dyn SettingsStore> = Arc::new(JsonFileSettingsStore::new(
            std::env::temp_dir().join(format!("loader-test-{:p}", &catalog)),
        ));
        let planner = Arc::new(ResourcePlanner::new(Arc::new(HostSystemInfo)));
        let registry = Arc::new(ModelRegistry::new());
        let sessions = Arc::new(SessionManager::new());
        let loader = ModelLoader::new(catalog, settings, planner, backend, registry.clone(), sessions);
        (loader, registry)
    }

    /// Delegates to `MockBackend` but counts `load_model` calls, so tests can
    /// assert exactly one native load happened under concurrency.
    struct CountingBackend {
        inner: MockBackend,
        load_calls: std::sync::atomic::AtomicU64,
    }

    impl Default for CountingBackend {
        fn default() -> Self {
            Self { inner: MockBackend::default(), load_calls: std::sync::atomic::AtomicU64::new(0) }
        }
    }

    impl InferenceBackend for CountingBackend {
        fn read_metadata(&self, path: &str) -> CoreResult<crate::backend::GgufMetadata> {
            self.inner.read_metadata(path)
        }

        fn load_model(&self, path: &str, gpu_layers: u32) -> CoreResult<crate::backend::ModelHandle> {
            self.load_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.load_model(path, gpu_layers)
        }

        fn dispose_model(&self, handle: crate::backend::ModelHandle) {
            self.inner.dispose_model(handle)
        }

        fn create_context(
            &self,
            model: &crate::backend::ModelHandle,
            context_size: u32,
            batch_size: u32,
            threads: u32,
        ) -> CoreResult<crate::backend::ContextHandle> {
            self.inner.create_context(model, context_size, batch_size, threads)
        }

        fn dispose_context(&self, handle: crate::backend::ContextHandle) {
            self.inner.dispose_context(handle)
        }

        fn create_session(&self, context: &crate::backend::ContextHandle, name: &str) -> CoreResult<crate::backend::SessionHandle> {
            self.inner.create_session(context, name)
        }

        fn dispose_session(&self, handle: crate::backend::SessionHandle) {
            self.inner.dispose_session(handle)
        }

        fn generate_tokens(
            &self,
            session: &crate::backend::SessionHandle,
            prompt: &str,
            options: &crate::types::GenerationOptions,
            cancel: &tokio_util::sync::CancellationToken,
            on_token: &mut dyn FnMut(u32),
        ) -> CoreResult<crate::types::StopReason> {
            self.inner.generate_tokens(session, prompt, options, cancel, on_token)
        }

        fn detokenize(&self, session: &crate::backend::SessionHandle, tokens: &[u32]) -> String {
            self.inner.detokenize(session, tokens)
        }

        fn snapshot_history(&self, session: &crate::backend::SessionHandle) -> Vec<crate::types::ChatMessage> {
            self.inner.snapshot_history(session)
        }

        fn restore_history(&self, session: &crate::backend::SessionHandle, history: Vec<crate::types::ChatMessage>) {
            self.inner.restore_history(session, history)
        }
    }

    #[tokio::test]
    async fn load_then_unload_round_trips() {
        let catalog = Arc::new(InMemoryCatalog::new(vec![descriptor("model1")]));
        let (loader, registry) = test_loader(catalog);

        loader.load_model("model1", Some("thread-a".into())).await.unwrap();
        assert!(registry.is_active("model1"));
        assert_eq!(registry.get_by_thread_id("thread-a"), Some("model1".to_string()));

        loader.unload("model1").unwrap();
        assert!(!registry.is_active("model1"));
    }

    #[tokio::test]
    async fn loading_unknown_model_fails_with_not_found() {
        let catalog = Arc::new(InMemoryCatalog::new(vec![]));
        let (loader, _registry) = test_loader(catalog);
        let err = loader.load_model("nope", None).await.unwrap_err();
        assert_eq!(err, CoreError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn loading_a_second_model_unloads_the_first() {
        let catalog = Arc::new(InMemoryCatalog::new(vec![descriptor("model1"), descriptor("model2")]));
        let (loader, registry) = test_loader(catalog);

        loader.load_model("model1", None).await.unwrap();
        loader.load_model("model2", None).await.unwrap();

        assert!(!registry.is_active("model1"));
        assert!(registry.is_active("model2"));
    }

    #[tokio::test]
    async fn reloading_an_active_model_is_idempotent() {
        let catalog = Arc::new(InMemoryCatalog::new(vec![descriptor("model1")]));
        let (loader, registry) = test_loader(catalog);

        loader.load_model("model1", None).await.unwrap();
        loader.load_model("model1", Some("thread-a".into())).await.unwrap();

        assert!(registry.is_active("model1"));
        assert_eq!(registry.get_by_thread_id("thread-a"), Some("model1".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_loads_of_the_same_model_perform_exactly_one_native_load() {
        let catalog = Arc::new(InMemoryCatalog::new(vec![descriptor("model1")]));
        let backend = Arc::new(CountingBackend::default());
        let (loader, registry) = test_loader_with_backend(catalog, backend.clone() as Arc<dyn InferenceBackend>);
        let loader = Arc::new(loader);

        let a = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load_model("model1", None).await }
        });
        let b = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load_model("model1", None).await }
        });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(registry.is_active("model1"));
        assert_eq!(backend.load_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
