//! Local module management: the capability-based selection policy and the
//! on-disk library of fetched modules.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use thiserror::Error;

use crate::{message::ModuleDescriptor, settings::ClientSettings};

const INDEX_FILE: &str = "modules.json";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("no compatible module for task {task_id}")]
    NoCompatibleModule { task_id: String },
    #[error("module storage failed: {0}")]
    Storage(#[from] io::Error),
    #[error("module index is corrupt: {0}")]
    Index(#[from] serde_json::Error),
}

/// Pick the module to run: the first candidate, in list order, whose
/// requirements this client's hardware profile satisfies. No relaxation and
/// no second pass; an incompatible list is an error.
pub fn select_module<'a>(
    candidates: &'a [ModuleDescriptor],
    profile: &ClientSettings,
) -> Result<&'a ModuleDescriptor, ModuleError> {
    candidates
        .iter()
        .find(|module| {
            module.use_cuda == profile.use_cuda
                && module.instance_type == profile.instance_type
                && module.min_ram_gb <= profile.ram_gb
        })
        .ok_or_else(|| ModuleError::NoCompatibleModule {
            task_id: profile.task_id.clone(),
        })
}

/// The client's module cache: fetched module files plus a JSON index mapping
/// task ids to file names, both under the configured module directory.
#[derive(Debug)]
pub struct ModuleLibrary {
    dir: PathBuf,
    index: HashMap<String, String>,
}

impl ModuleLibrary {
    /// Open the library, loading the index if one exists.
    pub fn open(dir: PathBuf) -> Result<Self, ModuleError> {
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_slice(&std::fs::read(&index_path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self { dir, index })
    }

    /// The path of the module registered for `task_id`, if the index knows it
    /// and the file is still present on disk.
    pub fn lookup(&self, task_id: &str) -> Option<PathBuf> {
        let path = self.dir.join(self.index.get(task_id)?);
        path.exists().then_some(path)
    }

    /// Store a fetched module and point the index at it.
    pub fn register(
        &mut self,
        task_id: &str,
        file_name: &str,
        content: &Bytes,
    ) -> Result<PathBuf, ModuleError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);
        std::fs::write(&path, content)?;
        self.index.insert(task_id.to_string(), file_name.to_string());
        std::fs::write(self.dir.join(INDEX_FILE), serde_json::to_vec(&self.index)?)?;
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
