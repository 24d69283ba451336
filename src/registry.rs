//! Model registry (spec §4.2): authoritative map of currently loaded models
//! and their associated threads; source of truth for "is this model loaded?"
//!
//! Grounded in the teacher's single-`SharedLlamaState` model-manager, but
//! generalized from "one implicit model" to an explicit map keyed by model
//! id, since this core's single-loaded-model policy is enforced by the
//! *loader* (spec §4.3) rather than baked into the registry's shape.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::backend::{ContextHandle, ModelHandle, SessionHandle};
use crate::types::{now_ms, ModelRuntimeSnapshot, RuntimeGpuType, UsageStats};

/// Native handles plus bookkeeping for one loaded model. Exists only while
/// the model is Active; owned exclusively by the worker (spec §3).
pub struct RuntimeInfo {
    pub model_id: String,
    pub model_path: String,
    pub model: ModelHandle,
    pub context: ContextHandle,
    pub session: SessionHandle,
    pub context_size: u32,
    pub gpu_layers: u32,
    pub batch_size: u32,
    pub loaded_at_ms: u64,
    pub last_used_at_ms: u64,
    pub loading_time_ms: u64,
    pub thread_ids: HashSet<String>,
}

impl RuntimeInfo {
    pub fn snapshot(&self, os: &str) -> ModelRuntimeSnapshot {
        ModelRuntimeSnapshot {
            model_id: self.model_id.clone(),
            model_path: self.model_path.clone(),
            context_size: self.context_size,
            gpu_layers: self.gpu_layers as i32,
            batch_size: self.batch_size,
            gpu_type: crate::types::runtime_gpu_type(Some(self.gpu_layers as i32), os),
            loaded_at_ms: self.loaded_at_ms,
            last_used_at_ms: self.last_used_at_ms,
            loading_time_ms: self.loading_time_ms,
            thread_ids: self.thread_ids.iter().cloned().collect(),
        }
    }
}

/// Outcome of [`ModelRegistry::begin_load`].
pub enum LoadClaim {
    AlreadyActive,
    Waiting(Arc<Notify>),
    Claimed,
}

/// Disposed native handles from one unregistration, handed back to the
/// caller (the loader/worker) so it can call into the backend. The registry
/// never calls backend dispose itself — spec §9's ownership rule names the
/// worker loop as "the only thread that calls native dispose."
pub struct DisposedHandles {
    pub session: SessionHandle,
    pub context: ContextHandle,
    pub model: ModelHandle,
}

#[derive(Default)]
pub struct ModelRegistry {
    active: Mutex<HashMap<String, RuntimeInfo>>,
    loading_locks: Mutex<HashMap<String, Arc<Notify>>>,
    usage: Mutex<HashMap<String, UsageStats>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: RuntimeInfo) {
        debug_assert!(
            !self.loading_locks.lock().unwrap().contains_key(&info.model_id),
            "model must not be both active and loading"
        );
        self.usage.lock().unwrap().entry(info.model_id.clone()).or_default();
        self.active.lock().unwrap().insert(info.model_id.clone(), info);
    }

    /// Looks up a model, bumping `lastUsedAt` as a side effect of access.
    pub fn touch(&self, model_id: &str) {
        if let Some(info) = self.active.lock().unwrap().get_mut(model_id) {
            info.last_used_at_ms = now_ms();
        }
    }

    pub fn is_active(&self, model_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(model_id)
    }

    pub fn snapshot(&self, model_id: &str, os: &str) -> Option<ModelRuntimeSnapshot> {
        self.active.lock().unwrap().get(model_id).map(|info| info.snapshot(os))
    }

    /// Run `f` against the active runtime info for `model_id`, if any. The
    /// only way callers reach native handles, since they live behind the
    /// active map's mutex (spec §9: "the registry owns runtime info").
    pub fn with_runtime_info<R>(&self, model_id: &str, f: impl FnOnce(&RuntimeInfo) -> R) -> Option<R> {
        self.active.lock().unwrap().get(model_id).map(f)
    }

    /// O(n) scan over active models, matching spec §4.2's stated complexity.
    pub fn get_by_thread_id(&self, thread_id: &str) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .values()
            .find(|info| info.thread_ids.contains(thread_id))
            .map(|info| info.model_id.clone())
    }

    pub fn associate_thread(&self, model_id: &str, thread_id: &str) {
        if let Some(info) = self.active.lock().unwrap().get_mut(model_id) {
            info.thread_ids.insert(thread_id.to_string());
        }
    }

    pub fn disassociate_thread(&self, thread_id: &str) {
        let mut active = self.active.lock().unwrap();
        for info in active.values_mut() {
            info.thread_ids.remove(thread_id);
        }
    }

    /// Atomically check whether `model_id` is already active or loading and,
    /// if neither, claim the loading lock — all under one critical section
    /// so two concurrent loaders can never both observe "not loading" and
    /// both start a native load (spec §4.3 steps 2-4, §8 "exactly one
    /// backend load is performed").
    pub fn begin_load(&self, model_id: &str) -> LoadClaim {
        let active = self.active.lock().unwrap();
        if active.contains_key(model_id) {
            return LoadClaim::AlreadyActive;
        }
        let mut locks = self.loading_locks.lock().unwrap();
        if let Some(notify) = locks.get(model_id) {
            return LoadClaim::Waiting(notify.clone());
        }
        locks.insert(model_id.to_string(), Arc::new(Notify::new()));
        LoadClaim::Claimed
    }

    /// Install a loading lock for `model_id`. Concurrent loaders call
    /// [`Self::loading_notify`] and await it instead of starting a second
    /// native load (spec §4.3 step 3/4). Exposed for tests; production
    /// callers should use [`Self::begin_load`], which checks and installs
    /// atomically.
    pub fn set_loading_lock(&self, model_id: &str) {
        self.loading_locks.lock().unwrap().insert(model_id.to_string(), Arc::new(Notify::new()));
    }

    pub fn is_loading(&self, model_id: &str) -> bool {
        self.loading_locks.lock().unwrap().contains_key(model_id)
    }

    pub fn loading_notify(&self, model_id: &str) -> Option<Arc<Notify>> {
        self.loading_locks.lock().unwrap().get(model_id).cloned()
    }

    /// Release the loading lock, waking any waiters (spec §4.3 step 10).
    pub fn release_loading_lock(&self, model_id: &str) {
        if let Some(notify) = self.loading_locks.lock().unwrap().remove(model_id) {
            notify.notify_waiters();
        }
    }

    /// Remove `model_id` from the active map, returning its session, context,
    /// and model handles for the caller to dispose in that order (spec
    /// §4.2/§4.3: session, then context, then model). Returns `None` if the
    /// model was not active. Usage stats outlive the runtime info (spec §3)
    /// and are deliberately left in `usage` across unload/reload cycles.
    pub fn unregister(&self, model_id: &str) -> Option<DisposedHandles> {
        let info = self.active.lock().unwrap().remove(model_id)?;
        Some(DisposedHandles { session: info.session, context: info.context, model: info.model })
    }

    /// Least-recently-used active model id, used by the loader to pick a
    /// victim to unload when enforcing the single-loaded-model invariant.
    pub fn get_lru(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .values()
            .min_by_key(|info| info.last_used_at_ms)
            .map(|info| info.model_id.clone())
    }

    /// Active model ids with no associated threads.
    pub fn get_unassociated(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.thread_ids.is_empty())
            .map(|info| info.model_id.clone())
            .collect()
    }

    pub fn active_model_ids(&self) -> Vec<String> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    pub fn record_prompt_usage(&self, model_id: &str, tokens: u64) {
        let mut usage = self.usage.lock().unwrap();
        let entry = usage.entry(model_id.to_string()).or_default();
        entry.total_prompts += 1;
        entry.total_tokens += tokens;
        entry.last_accessed_ms = now_ms();
    }

    pub fn usage_stats(&self, model_id: &str) -> UsageStats {
        self.usage.lock().unwrap().get(model_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContextHandle, ModelHandle, SessionHandle};

    fn runtime_info(model_id: &str, last_used_at_ms: u64) -> RuntimeInfo {
        RuntimeInfo {
            model_id: model_id.to_string(),
            model_path: format!("/m/{model_id}.gguf"),
            model: ModelHandle(Box::new(())),
            context: ContextHandle(Box::new(())),
            session: SessionHandle(Box::new(())),
            context_size: 4096,
            gpu_layers: 24,
            batch_size: 512,
            loaded_at_ms: 0,
            last_used_at_ms,
            loading_time_ms: 10,
            thread_ids: HashSet::new(),
        }
    }

    #[test]
    fn register_then_unregister_round_trips() {
        let registry = ModelRegistry::new();
        registry.register(runtime_info("model1", 1));
        assert!(registry.is_active("model1"));

        let disposed = registry.unregister("model1");
        assert!(disposed.is_some());
        assert!(!registry.is_active("model1"));
    }

    #[test]
    fn unregister_of_unknown_model_is_none() {
        let registry = ModelRegistry::new();
        assert!(registry.unregister("nope").is_none());
    }

    #[test]
    fn thread_association_round_trips_and_enables_lookup() {
        let registry = ModelRegistry::new();
        registry.register(runtime_info("model1", 1));
        registry.associate_thread("model1", "thread-a");
        assert_eq!(registry.get_by_thread_id("thread-a"), Some("model1".to_string()));

        registry.disassociate_thread("thread-a");
        assert_eq!(registry.get_by_thread_id("thread-a"), None);
    }

    #[test]
    fn lru_picks_the_least_recently_used_active_model() {
        let registry = ModelRegistry::new();
        registry.register(runtime_info("old", 10));
        registry.register(runtime_info("new", 20));
        assert_eq!(registry.get_lru(), Some("old".to_string()));
    }

    #[test]
    fn unassociated_models_are_reported() {
        let registry = ModelRegistry::new();
        registry.register(runtime_info("model1", 1));
        assert_eq!(registry.get_unassociated(), vec!["model1".to_string()]);
        registry.associate_thread("model1", "t1");
        assert!(registry.get_unassociated().is_empty());
    }

    #[test]
    fn begin_load_claims_exactly_once() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.begin_load("model1"), LoadClaim::Claimed));
        assert!(matches!(registry.begin_load("model1"), LoadClaim::Waiting(_)));

        registry.release_loading_lock("model1");
        registry.register(runtime_info("model1", 1));
        assert!(matches!(registry.begin_load("model1"), LoadClaim::AlreadyActive));
    }

    #[test]
    fn loading_lock_lifecycle() {
        let registry = ModelRegistry::new();
        assert!(!registry.is_loading("model1"));
        registry.set_loading_lock("model1");
        assert!(registry.is_loading("model1"));
        assert!(registry.loading_notify("model1").is_some());
        registry.release_loading_lock("model1");
        assert!(!registry.is_loading("model1"));
    }

    #[test]
    fn usage_stats_accumulate() {
        let registry = ModelRegistry::new();
        registry.record_prompt_usage("model1", 5);
        registry.record_prompt_usage("model1", 7);
        let stats = registry.usage_stats("model1");
        assert_eq!(stats.total_prompts, 2);
        assert_eq!(stats.total_tokens, 12);
    }

    #[test]
    fn usage_stats_survive_unload_reload() {
        let registry = ModelRegistry::new();
        registry.register(runtime_info("model1", 1));
        registry.record_prompt_usage("model1", 5);

        registry.unregister("model1");
        assert_eq!(registry.usage_stats("model1").total_prompts, 1);

        registry.register(runtime_info("model1", 2));
        assert_eq!(registry.usage_stats("model1").total_prompts, 1);
    }
}
