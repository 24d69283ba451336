//! Settings service (spec §4.4 "Effective-settings merge", §6): surfaces
//! user-overridable loading settings and assembles the runtime-info
//! snapshot the controller-facing API exposes, without holding a reference
//! back to the registry or loader — the capability-interface pattern spec
//! §9 names to avoid cyclic references.

use std::sync::Arc;

use crate::collaborators::SettingsStore;
use crate::error::{CoreError, CoreResult};
use crate::planner::ResourcePlanner;
use crate::registry::ModelRegistry;
use crate::types::{EffectiveSettings, ModelDescriptor, ModelLoadingSettings, ModelRuntimeSnapshot};

pub struct SettingsService {
    settings: Arc<dyn SettingsStore>,
    planner: Arc<ResourcePlanner>,
    registry: Arc<ModelRegistry>,
    os: String,
}

impl SettingsService {
    pub fn new(settings: Arc<dyn SettingsStore>, planner: Arc<ResourcePlanner>, registry: Arc<ModelRegistry>, os: impl Into<String>) -> Self {
        Self { settings, planner, registry, os: os.into() }
    }

    pub fn set_model_settings(&self, model_id: &str, settings: ModelLoadingSettings) {
        self.settings.save(model_id, settings);
    }

    /// `getModelSettings(modelId) → settings merged over computed defaults`
    /// (spec §8, "round-trip / idempotence").
    pub fn get_model_settings(&self, descriptor: &ModelDescriptor) -> CoreResult<EffectiveSettings> {
        let user = self.settings.load(&descriptor.id).unwrap_or_default();
        self.planner.plan(descriptor, user)
    }

    pub fn calculate_optimal_settings(&self, descriptor: &ModelDescriptor, requested: ModelLoadingSettings) -> CoreResult<EffectiveSettings> {
        self.planner.plan(descriptor, requested)
    }

    /// `getModelRuntimeInfo(modelId) → runtime snapshot` (spec §6): no
    /// native handles, `gpuType` and `loadingTime` added by
    /// [`crate::registry::RuntimeInfo::snapshot`].
    pub fn get_model_runtime_info(&self, model_id: &str) -> CoreResult<ModelRuntimeSnapshot> {
        self.registry.snapshot(model_id, &self.os).ok_or_else(|| CoreError::NotLoaded(model_id.to_string()))
    }

    pub fn clear_context_size_cache(&self) {
        self.planner.clear_context_size_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{GpuType, JsonFileSettingsStore, SystemInfo, SystemInfoSnapshot, VramState};

    struct FixedSystemInfo;
    impl SystemInfoSnapshot for FixedSystemInfo {
        fn snapshot(&self) -> SystemInfo {
            SystemInfo {
                total_ram_bytes: 32 * 1024 * 1024 * 1024,
                free_ram_bytes: 16 * 1024 * 1024 * 1024,
                cpu_threads: 8,
                has_gpu: true,
                gpu_type: GpuType::Nvidia,
                vram: Some(VramState { total_bytes: 24 * 1024 * 1024 * 1024, free_bytes: 20 * 1024 * 1024 * 1024 }),
            }
        }
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "model1".into(),
            display_name: "Model One".into(),
            filename: "model1.gguf".into(),
            path: "/m/model1.gguf".into(),
            size_bytes: 4 * 1024 * 1024 * 1024,
            layer_count: Some(32),
            trained_context_length: Some(4096),
            max_context_length: Some(4096),
            param_count: None,
            quantization: None,
        }
    }

    fn service() -> SettingsService {
        let settings: Arc<dyn SettingsStore> =
            Arc::new(JsonFileSettingsStore::new(std::env::temp_dir().join(format!("settings-test-{:p}", &0))));
        let planner = Arc::new(ResourcePlanner::new(Arc::new(FixedSystemInfo)));
        let registry = Arc::new(ModelRegistry::new());
        SettingsService::new(settings, planner, registry, "linux")
    }

    #[test]
    fn set_then_get_settings_merges_over_computed_defaults() {
        let service = service();
        let descriptor = descriptor();
        service.set_model_settings(&descriptor.id, ModelLoadingSettings { temperature: Some(0.2), ..Default::default() });
        let effective = service.get_model_settings(&descriptor).unwrap();
        assert_eq!(effective.temperature, 0.2);
    }

    #[test]
    fn runtime_info_for_unloaded_model_fails_not_loaded() {
        let service = service();
        let err = service.get_model_runtime_info("nope").unwrap_err();
        assert_eq!(err, CoreError::NotLoaded("nope".to_string()));
    }
}
