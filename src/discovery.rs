//! Filesystem-backed `ModelDiscovery` for the standalone binary. On-disk
//! model layout is an explicit non-goal of the core itself (spec §1) — this
//! is main.rs's own wiring, the same role the teacher's Tauri commands play
//! for its desktop app, not part of the crate's public contract.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use llama_core::collaborators::ModelDiscovery;
use llama_core::types::ModelDescriptor;

pub struct DirectoryModelDiscovery {
    dir: PathBuf,
    cache: Mutex<Option<Vec<ModelDescriptor>>>,
}

impl DirectoryModelDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), cache: Mutex::new(None) }
    }

    fn scan(&self) -> Vec<ModelDescriptor> {
        let mut entries = Vec::new();
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return entries;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
                continue;
            }
            if let Some(descriptor) = descriptor_for(&path) {
                entries.push(descriptor);
            }
        }
        entries
    }
}

fn descriptor_for(path: &Path) -> Option<ModelDescriptor> {
    let filename = path.file_name()?.to_str()?.to_string();
    let id = path.file_stem()?.to_str()?.to_string();
    let size_bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    Some(ModelDescriptor {
        id: id.clone(),
        display_name: id,
        filename,
        path: path.to_string_lossy().into_owned(),
        size_bytes,
        layer_count: None,
        trained_context_length: None,
        max_context_length: None,
        param_count: None,
        quantization: None,
    })
}

impl ModelDiscovery for DirectoryModelDiscovery {
    fn resolve(&self, id_or_name: &str) -> Option<ModelDescriptor> {
        self.list().into_iter().find(|d| d.id == id_or_name || d.filename == id_or_name || d.display_name == id_or_name)
    }

    fn list(&self) -> Vec<ModelDescriptor> {
        let mut guard = self.cache.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.scan());
        }
        guard.clone().unwrap_or_default()
    }
}
