//! External collaborators (spec §1 non-goals, SPEC_FULL.md §A.4): small
//! capability interfaces the loader, planner, and settings service depend on
//! without holding a reference back to their owner — the "cyclic references"
//! design note in spec §9. Each trait has one default, file/probe-backed
//! implementation good enough for tests and small deployments; callers are
//! expected to substitute their own.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::{ModelDescriptor, ModelLoadingSettings};
pub use crate::types::GpuType;

/// Resolves a model id, display name, or `*.gguf` filename to its catalog
/// entry. On-disk layout and remote discovery/download are explicit
/// non-goals (spec §1) — this trait is the seam a host application wires up.
pub trait ModelDiscovery: Send + Sync {
    fn resolve(&self, id_or_name: &str) -> Option<ModelDescriptor>;
    fn list(&self) -> Vec<ModelDescriptor>;
}

/// Persists user-chosen `ModelLoadingSettings` per model id. Persistence
/// format/location is a non-goal; this is ambient test/dev tooling.
pub trait SettingsStore: Send + Sync {
    fn load(&self, model_id: &str) -> Option<ModelLoadingSettings>;
    fn save(&self, model_id: &str, settings: ModelLoadingSettings);
}

/// Snapshot of host capabilities the resource planner consumes (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VramState {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemInfo {
    pub total_ram_bytes: u64,
    pub free_ram_bytes: u64,
    pub cpu_threads: u32,
    pub has_gpu: bool,
    pub gpu_type: GpuType,
    /// `None` when VRAM could not be determined — the planner must fail
    /// with `ResourceUnavailable` rather than silently falling back
    /// (spec §4.4).
    pub vram: Option<VramState>,
}

/// Probes host RAM/CPU/GPU capacity. Grounded in the teacher's
/// `vram_calculator::get_available_vram_gb`, which shells out to
/// `nvidia-smi` and falls back to a documented default when unavailable.
pub trait SystemInfoSnapshot: Send + Sync {
    fn snapshot(&self) -> SystemInfo;
}

/// In-memory catalog, good enough for tests and small single-machine
/// deployments. A real host would back this with the filesystem scan the
/// spec deliberately keeps out of scope.
#[derive(Default)]
pub struct InMemoryCatalog {
    entries: Mutex<Vec<ModelDescriptor>>,
}

impl InMemoryCatalog {
    pub fn new(entries: Vec<ModelDescriptor>) -> Self {
        Self { entries: Mutex::new(entries) }
    }

    pub fn insert(&self, descriptor: ModelDescriptor) {
        self.entries.lock().unwrap().push(descriptor);
    }
}

impl ModelDiscovery for InMemoryCatalog {
    fn resolve(&self, id_or_name: &str) -> Option<ModelDescriptor> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|d| d.id == id_or_name || d.display_name == id_or_name || d.filename == id_or_name)
            .cloned()
    }

    fn list(&self) -> Vec<ModelDescriptor> {
        self.entries.lock().unwrap().clone()
    }
}

/// Flat JSON-file settings store, one entry per model id in a single file,
/// generalized from the teacher's `config.rs` (`load_config`/`add_to_model_history`
/// read and rewrite one whole `assets/config.json` file per call — same
/// shape here, keyed by model id instead of one global sampler config).
pub struct JsonFileSettingsStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, ModelLoadingSettings>>,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    models: HashMap<String, ModelLoadingSettings>,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let models = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<StoreFile>(&content).ok())
            .map(|f| f.models)
            .unwrap_or_default();
        Self { path, cache: Mutex::new(models) }
    }

    fn flush(&self, models: &HashMap<String, ModelLoadingSettings>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = StoreFile { models: models.clone() };
        if let Ok(json) = serde_json::to_string_pretty(&file) {
            let _ = fs::write(&self.path, json);
        }
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn load(&self, model_id: &str) -> Option<ModelLoadingSettings> {
        self.cache.lock().unwrap().get(model_id).copied()
    }

    fn save(&self, model_id: &str, settings: ModelLoadingSettings) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(model_id.to_string(), settings);
        self.flush(&cache);
    }
}

/// Default `nvidia-smi`-backed system info probe, grounded 1:1 in the
/// teacher's `vram_calculator::get_available_vram_gb`: try `nvidia-smi`,
/// fall back to a conservative assumed default on any failure rather than
/// reporting "no GPU".
pub struct HostSystemInfo;

impl HostSystemInfo {
    /// Conservative VRAM assumption when detection fails, matching the
    /// teacher's `DEFAULT_VRAM_GB`.
    pub const DEFAULT_VRAM_BYTES: u64 = 22 * 1024 * 1024 * 1024;

    fn probe_nvidia_vram() -> Option<(u64, u64)> {
        let output = std::process::Command::new("nvidia-smi")
            .args(["--query-gpu=memory.total,memory.free", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8(output.stdout).ok()?;
        let mut parts = text.trim().split(',').map(|s| s.trim());
        let total_mb: u64 = parts.next()?.parse().ok()?;
        let free_mb: u64 = parts.next()?.parse().ok()?;
        Some((total_mb * 1024 * 1024, free_mb * 1024 * 1024))
    }
}

impl SystemInfoSnapshot for HostSystemInfo {
    fn snapshot(&self) -> SystemInfo {
        let cpu_threads = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4);

        let (has_gpu, gpu_type, vram) = match Self::probe_nvidia_vram() {
            Some((total_bytes, free_bytes)) => {
                (true, GpuType::Nvidia, Some(VramState { total_bytes, free_bytes }))
            }
            None => {
                log::info!("could not detect VRAM via nvidia-smi, assuming default capacity");
                (
                    true,
                    GpuType::Unknown,
                    Some(VramState {
                        total_bytes: Self::DEFAULT_VRAM_BYTES,
                        free_bytes: Self::DEFAULT_VRAM_BYTES,
                    }),
                )
            }
        };

        SystemInfo {
            total_ram_bytes: 0,
            free_ram_bytes: 0,
            cpu_threads,
            has_gpu,
            gpu_type,
            vram,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_catalog_resolves_by_id_name_or_filename() {
        let catalog = InMemoryCatalog::new(vec![ModelDescriptor {
            id: "model1".into(),
            display_name: "Model One".into(),
            filename: "model-one.gguf".into(),
            path: "/m/model-one.gguf".into(),
            size_bytes: 1024,
            layer_count: Some(32),
            trained_context_length: Some(8192),
            max_context_length: Some(8192),
            param_count: None,
            quantization: None,
        }]);

        assert!(catalog.resolve("model1").is_some());
        assert!(catalog.resolve("Model One").is_some());
        assert!(catalog.resolve("model-one.gguf").is_some());
        assert!(catalog.resolve("nope").is_none());
    }

    #[test]
    fn json_file_settings_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("llm-core-test-{}", now_suffix()));
        let path = dir.join("settings.json");
        let store = JsonFileSettingsStore::new(&path);
        assert!(store.load("model1").is_none());

        let settings = ModelLoadingSettings { gpu_layers: Some(24), ..Default::default() };
        store.save("model1", settings);
        assert_eq!(store.load("model1"), Some(settings));

        // A fresh store reading the same path sees the persisted value.
        let reopened = JsonFileSettingsStore::new(&path);
        assert_eq!(reopened.load("model1"), Some(settings));

        let _ = fs::remove_dir_all(&dir);
    }

    fn now_suffix() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }
}
