//! Resource planner (spec §4.4): picks a safe `(contextSize, gpuLayers,
//! batchSize, threads)` tuple from host capabilities and model metadata, and
//! memoizes the context-size decision.

pub mod context_cache;
pub mod gpu;

use std::sync::Arc;

use crate::collaborators::{GpuType, SystemInfoSnapshot};
use crate::error::CoreResult;
use crate::types::{EffectiveSettings, ModelDescriptor, ModelLoadingSettings, DEFAULT_TEMPERATURE};

use context_cache::ContextSizeCache;
use gpu::{
    bucketed_fallback_batch_size, calculate_cpu_batch_size, calculate_safe_context_size, estimate_context_bytes,
    CpuDescriptor, GpuDescriptor, GpuLayerCalculator, GpuLibrary, HeuristicGpuLayerCalculator, ModelArchEstimate,
};

pub struct ResourcePlanner {
    system_info: Arc<dyn SystemInfoSnapshot>,
    gpu_calculator: Arc<dyn GpuLayerCalculator>,
    context_cache: ContextSizeCache,
}

fn gpu_library_for(gpu_type: GpuType) -> GpuLibrary {
    match gpu_type {
        GpuType::Nvidia => GpuLibrary::Cuda,
        GpuType::Amd => GpuLibrary::Rocm,
        GpuType::Apple => GpuLibrary::Metal,
        GpuType::Unknown => GpuLibrary::Cpu,
    }
}

impl ResourcePlanner {
    pub fn new(system_info: Arc<dyn SystemInfoSnapshot>) -> Self {
        Self::with_calculator(system_info, Arc::new(HeuristicGpuLayerCalculator))
    }

    pub fn with_calculator(system_info: Arc<dyn SystemInfoSnapshot>, gpu_calculator: Arc<dyn GpuLayerCalculator>) -> Self {
        Self { system_info, gpu_calculator, context_cache: ContextSizeCache::new() }
    }

    /// `clearContextSizeCache` (spec §6).
    pub fn clear_context_size_cache(&self) {
        self.context_cache.clear();
    }

    /// Compute the effective settings for loading `descriptor`, merging
    /// `user`-requested overrides over the planner's computed defaults.
    pub fn plan(&self, descriptor: &ModelDescriptor, user: ModelLoadingSettings) -> CoreResult<EffectiveSettings> {
        let system = self.system_info.snapshot();
        // Model-specific architecture facts aren't part of ModelDescriptor;
        // spec §4.4 explicitly falls back to estimated-model constants when
        // the model doesn't expose its own.
        let arch = ModelArchEstimate::default();

        let requested_ctx = user
            .context_size
            .or(descriptor.max_context_length)
            .or(descriptor.trained_context_length)
            .unwrap_or(4096);

        let free_vram_bytes = system.vram.map(|v| v.free_bytes);

        let (context_size, _was_reduced) =
            match self.context_cache.get(&descriptor.filename, descriptor.size_bytes, requested_ctx) {
                Some(cached) => cached,
                None => {
                    let (ctx, reduced) = calculate_safe_context_size(requested_ctx, free_vram_bytes, &arch)?;
                    self.context_cache.put(&descriptor.filename, descriptor.size_bytes, requested_ctx, ctx, reduced);
                    (ctx, reduced)
                }
            };

        let context_bytes = estimate_context_bytes(context_size, &arch);
        let cpu_desc = CpuDescriptor {
            threads: system.cpu_threads,
            total_ram_bytes: system.total_ram_bytes,
            free_ram_bytes: system.free_ram_bytes,
        };

        let (gpu_layers, batch_size) = if system.has_gpu {
            match system.vram {
                Some(vram) => {
                    let gpu_desc = GpuDescriptor {
                        library: gpu_library_for(system.gpu_type),
                        total_bytes: vram.total_bytes,
                        free_bytes: vram.free_bytes,
                    };
                    match self.gpu_calculator.calculate(&cpu_desc, &gpu_desc, descriptor.size_bytes, descriptor.layer_count) {
                        Ok((0, _)) => {
                            let batch =
                                calculate_cpu_batch_size(&cpu_desc, Some(vram.free_bytes), descriptor.size_bytes, context_bytes);
                            (0, batch)
                        }
                        Ok((num_gpu, num_batch)) => {
                            let capped = match descriptor.layer_count {
                                Some(layers) => num_gpu.min(layers),
                                None => num_gpu,
                            };
                            (capped, num_batch)
                        }
                        Err(_) => (0, bucketed_fallback_batch_size(descriptor.size_bytes, context_size)),
                    }
                }
                None => (0, bucketed_fallback_batch_size(descriptor.size_bytes, context_size)),
            }
        } else {
            let batch = calculate_cpu_batch_size(&cpu_desc, None, descriptor.size_bytes, context_bytes);
            (0, batch)
        };

        // Leave one core free for the worker's own event loop.
        let threads = system.cpu_threads.saturating_sub(1).max(1);

        let computed =
            EffectiveSettings { gpu_layers, context_size, batch_size, threads, temperature: DEFAULT_TEMPERATURE };

        Ok(EffectiveSettings::merge(user, computed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{SystemInfo, VramState};

    struct FixedSystemInfo(SystemInfo);
    impl SystemInfoSnapshot for FixedSystemInfo {
        fn snapshot(&self) -> SystemInfo {
            self.0
        }
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            id: "model1".into(),
            display_name: "Model One".into(),
            filename: "model-one.gguf".into(),
            path: "/m/model-one.gguf".into(),
            size_bytes: 4 * 1024 * 1024 * 1024,
            layer_count: Some(32),
            trained_context_length: Some(8192),
            max_context_length: Some(8192),
            param_count: None,
            quantization: None,
        }
    }

    #[test]
    fn plans_gpu_layers_and_context_when_vram_is_plentiful() {
        let system = SystemInfo {
            total_ram_bytes: 32 * 1024 * 1024 * 1024,
            free_ram_bytes: 16 * 1024 * 1024 * 1024,
            cpu_threads: 8,
            has_gpu: true,
            gpu_type: GpuType::Nvidia,
            vram: Some(VramState { total_bytes: 24 * 1024 * 1024 * 1024, free_bytes: 20 * 1024 * 1024 * 1024 }),
        };
        let planner = ResourcePlanner::new(Arc::new(FixedSystemInfo(system)));
        let effective = planner.plan(&descriptor(), ModelLoadingSettings::default()).unwrap();

        assert_eq!(effective.context_size, 8192);
        assert!(effective.gpu_layers > 0);
        assert_eq!(effective.threads, 7);
        assert_eq!(effective.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn falls_back_to_cpu_when_no_gpu_reported() {
        let system = SystemInfo {
            total_ram_bytes: 16 * 1024 * 1024 * 1024,
            free_ram_bytes: 8 * 1024 * 1024 * 1024,
            cpu_threads: 4,
            has_gpu: false,
            gpu_type: GpuType::Unknown,
            vram: None,
        };
        let planner = ResourcePlanner::new(Arc::new(FixedSystemInfo(system)));
        let err = planner.plan(&descriptor(), ModelLoadingSettings::default()).unwrap_err();
        // No GPU means no VRAM state either in this host snapshot, so the
        // context-size algorithm must fail loudly rather than guess.
        assert!(matches!(err, crate::error::CoreError::ResourceUnavailable(_)));
    }

    #[test]
    fn gpu_layers_escape_hatch_uses_computed_value() {
        let system = SystemInfo {
            total_ram_bytes: 32 * 1024 * 1024 * 1024,
            free_ram_bytes: 16 * 1024 * 1024 * 1024,
            cpu_threads: 8,
            has_gpu: true,
            gpu_type: GpuType::Nvidia,
            vram: Some(VramState { total_bytes: 24 * 1024 * 1024 * 1024, free_bytes: 20 * 1024 * 1024 * 1024 }),
        };
        let planner = ResourcePlanner::new(Arc::new(FixedSystemInfo(system)));
        let user = ModelLoadingSettings { gpu_layers: Some(-1), ..Default::default() };
        let effective = planner.plan(&descriptor(), user).unwrap();
        assert!(effective.gpu_layers > 0);
    }
}
