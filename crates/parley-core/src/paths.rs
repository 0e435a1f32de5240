use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub storage_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            config_path: root.join("config.json"),
            storage_dir: root.join("storage"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Platform data directory for Parley, e.g. `~/.local/share/parley` on Linux.
pub fn default_state_root() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to resolve data dir"))?;
    Ok(base.join("parley"))
}
