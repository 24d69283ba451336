//! Core data model (spec §3): model catalog entries, loading settings,
//! runtime snapshots, and usage statistics. Native handles never appear
//! here — this module is shared by controller and worker code alike.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable catalog entry for one on-disk model file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub filename: String,
    pub path: String,
    pub size_bytes: u64,
    pub layer_count: Option<u32>,
    pub trained_context_length: Option<u32>,
    pub max_context_length: Option<u32>,
    pub param_count: Option<u64>,
    pub quantization: Option<String>,
}

/// User-overridable loading settings. Every field is optional; the resource
/// planner derives anything left unset. `gpu_layers == Some(-1)` means
/// "use the computed value" even though the field is present.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelLoadingSettings {
    pub gpu_layers: Option<i32>,
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub threads: Option<u32>,
    pub temperature: Option<f32>,
}

/// Fully-resolved settings after merging user overrides over planner
/// defaults (spec §4.4, "Effective-settings merge").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub temperature: f32,
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

impl EffectiveSettings {
    /// Merge `user` over `computed`, applying the `gpu_layers == -1` escape
    /// hatch that means "use the computed value" even when present.
    pub fn merge(user: ModelLoadingSettings, computed: EffectiveSettings) -> Self {
        let gpu_layers = match user.gpu_layers {
            Some(-1) | None => computed.gpu_layers,
            Some(n) => n.max(0) as u32,
        };
        Self {
            gpu_layers,
            context_size: user.context_size.unwrap_or(computed.context_size),
            batch_size: user.batch_size.unwrap_or(computed.batch_size),
            threads: user.threads.unwrap_or(computed.threads),
            temperature: user.temperature.unwrap_or(computed.temperature),
        }
    }
}

/// GPU family as reported by the host, used for both planning and the
/// runtime-info `gpuType` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GpuType {
    Nvidia,
    Amd,
    Apple,
    Unknown,
}

/// Surfaced `gpuType` on `ModelRuntimeSnapshot`, distinct from [`GpuType`]:
/// this is the three-way value spec §6 names (`metal`/`cuda`/`cpu`), derived
/// from effective `gpu_layers` and the host platform, not from [`GpuType`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeGpuType {
    Metal,
    Cuda,
    Cpu,
}

/// Compute the runtime-info GPU-type rule from spec §6: zero/negative/unknown
/// `gpu_layers` is always `cpu`, regardless of platform. `os` is expected to
/// be a `std::env::consts::OS` value (`"macos"`, `"windows"`, `"linux"`, …).
pub fn runtime_gpu_type(gpu_layers: Option<i32>, os: &str) -> RuntimeGpuType {
    match gpu_layers {
        Some(n) if n > 0 => match os {
            "macos" => RuntimeGpuType::Metal,
            "linux" | "windows" => RuntimeGpuType::Cuda,
            _ => RuntimeGpuType::Cpu,
        },
        _ => RuntimeGpuType::Cpu,
    }
}

/// Snapshot of [`crate::registry::RuntimeInfo`] with native handles stripped
/// out, safe to serialize across the controller/worker boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRuntimeSnapshot {
    pub model_id: String,
    pub model_path: String,
    pub context_size: u32,
    pub gpu_layers: i32,
    pub batch_size: u32,
    pub gpu_type: RuntimeGpuType,
    pub loaded_at_ms: u64,
    pub last_used_at_ms: u64,
    pub loading_time_ms: u64,
    pub thread_ids: Vec<String>,
}

/// Per-model-id usage counters, outliving the runtime info until process exit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub total_prompts: u64,
    pub total_tokens: u64,
    pub last_accessed_ms: u64,
}

/// Milliseconds since the Unix epoch, used throughout for `loadedAt` /
/// `lastUsedAt` / cache-entry timestamps. Centralized so tests can reason
/// about a single time source.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single chat message, role + content, as carried in generation requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Options accepted by `generateResponse` / `generateStreamResponse` (spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub seed: Option<i64>,
    pub thread_id: Option<String>,
    pub disable_functions: bool,
    pub disable_chat_history: bool,
}

/// Why a generation stopped, surfaced on both streaming and non-streaming
/// completions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    Abort,
}

/// Result of a non-streaming `generateResponse` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub content: String,
    /// Character-count proxy for tokens generated (spec §4.6, a documented
    /// limitation — see SPEC_FULL.md open questions).
    pub tokens_generated: u64,
    pub stop_reason: StopReason,
}

/// A tool the worker can invoke mid-generation via the reverse bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}
