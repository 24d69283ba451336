//! Context-memory estimation and GPU-layer/batch-size calculation (spec
//! §4.4). Grounded in the teacher's `vram_calculator.rs` (`nvidia-smi`
//! probing, model-size-bucketed fallback table, power-of-2 context rounding)
//! but replaced with the spec's literal KV-cache/input-buffer/compute-buffer
//! formulas rather than the teacher's own size-bucket heuristic for context
//! sizing.

use crate::error::{CoreError, CoreResult};

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
pub const MIN_CONTEXT_SIZE: u32 = 512;
pub const MIN_GPU_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Architecture constants the context-memory estimate needs. Populated from
/// GGUF metadata when available; spec §4.4's estimated-model defaults
/// otherwise (`{hidden=4096, layers=48, heads=32, kvHeads=8}`), a deliberate
/// over-estimate bias for safety.
#[derive(Debug, Clone, Copy)]
pub struct ModelArchEstimate {
    pub hidden_size: u32,
    pub layers: u32,
    pub heads: u32,
    pub kv_heads: u32,
}

impl Default for ModelArchEstimate {
    fn default() -> Self {
        Self { hidden_size: 4096, layers: 48, heads: 32, kv_heads: 8 }
    }
}

/// KV cache term: `2·(hidden/(heads/kvHeads))·layers·ctx·(16/8)` bytes.
pub fn kv_cache_bytes(ctx: u32, arch: &ModelArchEstimate) -> f64 {
    let head_dim_total = arch.hidden_size as f64 / (arch.heads as f64 / arch.kv_heads as f64);
    2.0 * head_dim_total * arch.layers as f64 * ctx as f64 * (16.0 / 8.0)
}

/// Input buffer term: proportional to `ctx·bsz` with `bsz=512`.
pub fn input_buffer_bytes(ctx: u32) -> f64 {
    const BSZ: f64 = 512.0;
    const BYTES_PER_UNIT: f64 = 2.0;
    ctx as f64 * BSZ * BYTES_PER_UNIT
}

/// Compute buffer term: `((ctx/1024)·2 + 0.75)·heads·1 MiB`.
pub fn compute_buffer_bytes(ctx: u32, arch: &ModelArchEstimate) -> f64 {
    ((ctx as f64 / 1024.0) * 2.0 + 0.75) * arch.heads as f64 * BYTES_PER_MB
}

/// Sum of the three context-memory terms for a candidate context size.
pub fn estimate_context_bytes(ctx: u32, arch: &ModelArchEstimate) -> f64 {
    kv_cache_bytes(ctx, arch) + input_buffer_bytes(ctx) + compute_buffer_bytes(ctx, arch)
}

/// Context-size algorithm (spec §4.4): if the requested size fits, return it
/// unchanged; otherwise binary-search the largest size in `[512, requested]`
/// that fits, never returning below 512.
///
/// `free_vram_bytes` is `None` when the host's VRAM state could not be read;
/// callers must treat that as `ResourceUnavailable`, not a silent fallback.
pub fn calculate_safe_context_size(
    requested: u32,
    free_vram_bytes: Option<u64>,
    arch: &ModelArchEstimate,
) -> CoreResult<(u32, bool)> {
    let free_vram_bytes = free_vram_bytes
        .ok_or_else(|| CoreError::ResourceUnavailable("VRAM state could not be determined".into()))?;

    let available_vram = 0.8 * free_vram_bytes as f64;

    if estimate_context_bytes(requested, arch) <= available_vram {
        return Ok((requested, false));
    }

    let mut low = MIN_CONTEXT_SIZE;
    let mut high = requested;
    let mut best = MIN_CONTEXT_SIZE;

    // Binary search the largest ctx in [512, requested] whose estimate fits.
    while low <= high {
        let mid = low + (high - low) / 2;
        if estimate_context_bytes(mid, arch) <= available_vram {
            best = mid;
            low = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            high = mid - 1;
        }
    }

    Ok((best.max(MIN_CONTEXT_SIZE), true))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuLibrary {
    Cuda,
    Rocm,
    Metal,
    Cpu,
}

#[derive(Debug, Clone, Copy)]
pub struct GpuDescriptor {
    pub library: GpuLibrary,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    pub threads: u32,
    pub total_ram_bytes: u64,
    pub free_ram_bytes: u64,
}

/// The "subsystem" spec §4.4 delegates GPU-layer/batch-size calculation to.
/// Modeled as a trait so a host can substitute a more precise calculator;
/// [`HeuristicGpuLayerCalculator`] is a reasonable default grounded in the
/// teacher's VRAM-ratio heuristic.
pub trait GpuLayerCalculator: Send + Sync {
    fn calculate(
        &self,
        cpu: &CpuDescriptor,
        gpu: &GpuDescriptor,
        model_size_bytes: u64,
        layer_count: Option<u32>,
    ) -> CoreResult<(u32, u32)>;
}

/// Ratio-based heuristic: GPU layers scale with how much of the model's
/// footprint fits in free VRAM above the 1 GiB floor; batch size is 512
/// whenever the model fits comfortably, halved otherwise. Mirrors the
/// teacher's `calculate_optimal_gpu_layers` VRAM-ratio logic.
pub struct HeuristicGpuLayerCalculator;

impl GpuLayerCalculator for HeuristicGpuLayerCalculator {
    fn calculate(
        &self,
        _cpu: &CpuDescriptor,
        gpu: &GpuDescriptor,
        model_size_bytes: u64,
        layer_count: Option<u32>,
    ) -> CoreResult<(u32, u32)> {
        if gpu.free_bytes < MIN_GPU_MEMORY_BYTES {
            return Ok((0, 512));
        }

        let total_layers = layer_count.unwrap_or(48);
        let model_size_gb = model_size_bytes as f64 / BYTES_PER_GB;
        let usable_vram_gb = (gpu.free_bytes as f64 / BYTES_PER_GB
            - MIN_GPU_MEMORY_BYTES as f64 / BYTES_PER_GB)
            .max(0.0);

        let fit_ratio = if model_size_gb > 0.0 { (usable_vram_gb / model_size_gb).min(1.0) } else { 1.0 };
        let num_gpu = (total_layers as f64 * fit_ratio).floor() as u32;
        let num_batch = if fit_ratio >= 1.0 { 512 } else { 256 };

        Ok((num_gpu, num_batch))
    }
}

/// Model-size-bucketed fallback batch size, used both on calculator error and
/// in CPU-only mode's upstream caller (spec §4.4's second bucket table:
/// `>15 GB → 1024|2048`, `8–15 GB → 2048|4096`, `4–8 GB → 4096|8192`,
/// `<4 GB → 8192|16384`, larger number when `ctx ≤ 8192`).
pub fn bucketed_fallback_batch_size(model_size_bytes: u64, ctx: u32) -> u32 {
    let model_size_gb = model_size_bytes as f64 / BYTES_PER_GB;
    let (small, large) = if model_size_gb > 15.0 {
        (1024, 2048)
    } else if model_size_gb >= 8.0 {
        (2048, 4096)
    } else if model_size_gb >= 4.0 {
        (4096, 8192)
    } else {
        (8192, 16384)
    };
    if ctx <= 8192 {
        large
    } else {
        small
    }
}

/// CPU-only batch size: `max(1, min(512, floor(availableForBatchGB*1024 /
/// paramsEstimateMB)))`, where `availableForBatch` subtracts model size,
/// context memory, and a 1 GiB system reserve from free RAM (plus 30% of
/// free VRAM when a unified/available GPU is reported).
///
/// `paramsEstimateMB` is read here as the model's on-disk footprint
/// expressed in MB per billion parameters (file size scaled down by 1000),
/// a defensible stand-in for the spec's unspecified per-parameter constant —
/// recorded as an open-question resolution in DESIGN.md.
pub fn calculate_cpu_batch_size(
    cpu: &CpuDescriptor,
    unified_vram_free_bytes: Option<u64>,
    model_size_bytes: u64,
    context_bytes: f64,
) -> u32 {
    let reserve_bytes = 1024.0 * BYTES_PER_MB;
    let unified_bonus = unified_vram_free_bytes.map(|v| 0.3 * v as f64).unwrap_or(0.0);

    let available_for_batch_bytes =
        (cpu.free_ram_bytes as f64 - model_size_bytes as f64 - context_bytes - reserve_bytes + unified_bonus)
            .max(0.0);
    let available_for_batch_gb = available_for_batch_bytes / BYTES_PER_GB;

    let params_estimate_mb = (model_size_bytes as f64 / BYTES_PER_MB / 1000.0).max(0.001);
    let candidate = (available_for_batch_gb * 1024.0 / params_estimate_mb).floor();

    (candidate.max(1.0) as u32).min(512).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_cache_scales_linearly_with_context() {
        let arch = ModelArchEstimate::default();
        let at_2k = kv_cache_bytes(2048, &arch);
        let at_4k = kv_cache_bytes(4096, &arch);
        assert!((at_4k / at_2k - 2.0).abs() < 1e-9);
    }

    #[test]
    fn requested_context_returned_unchanged_when_it_fits() {
        let arch = ModelArchEstimate::default();
        let huge_vram = 200 * 1024 * 1024 * 1024u64;
        let (ctx, reduced) = calculate_safe_context_size(4096, Some(huge_vram), &arch).unwrap();
        assert_eq!(ctx, 4096);
        assert!(!reduced);
    }

    #[test]
    fn context_reduced_but_never_below_floor() {
        let arch = ModelArchEstimate::default();
        let tiny_vram = 1024 * 1024 * 1024u64; // 1 GiB free
        let (ctx, reduced) = calculate_safe_context_size(32768, Some(tiny_vram), &arch).unwrap();
        assert!(ctx < 32768);
        assert!(ctx >= MIN_CONTEXT_SIZE);
        assert!(reduced);
    }

    #[test]
    fn unreadable_vram_state_is_resource_unavailable() {
        let arch = ModelArchEstimate::default();
        let err = calculate_safe_context_size(4096, None, &arch).unwrap_err();
        assert_eq!(err, CoreError::ResourceUnavailable("VRAM state could not be determined".into()));
    }

    #[test]
    fn no_gpu_memory_yields_cpu_only() {
        let calc = HeuristicGpuLayerCalculator;
        let cpu = CpuDescriptor { threads: 8, total_ram_bytes: 0, free_ram_bytes: 0 };
        let gpu = GpuDescriptor { library: GpuLibrary::Cuda, total_bytes: 0, free_bytes: 0 };
        let (num_gpu, _num_batch) = calc.calculate(&cpu, &gpu, 4 * 1024 * 1024 * 1024, Some(32)).unwrap();
        assert_eq!(num_gpu, 0);
    }

    #[test]
    fn bucketed_fallback_picks_larger_value_for_small_context() {
        let batch = bucketed_fallback_batch_size(20 * 1024 * 1024 * 1024, 4096);
        assert_eq!(batch, 2048);
        let batch_big_ctx = bucketed_fallback_batch_size(20 * 1024 * 1024 * 1024, 16384);
        assert_eq!(batch_big_ctx, 1024);
    }

    #[test]
    fn cpu_batch_size_is_at_least_one_and_at_most_512() {
        let cpu = CpuDescriptor { threads: 8, total_ram_bytes: 16 * 1024 * 1024 * 1024, free_ram_bytes: 8 * 1024 * 1024 * 1024 };
        let batch = calculate_cpu_batch_size(&cpu, None, 1024 * 1024 * 1024, 0.0);
        assert!(batch >= 1);
        assert!(batch <= 512);
    }
}
