//! OS data directories for the backend.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR: &str = "ai.monad.offline";

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub root: PathBuf,
    pub data: PathBuf,
    pub models: PathBuf,
}

impl AppPaths {
    /// Platform data dir (`~/.local/share`, `~/Library/Application Support`,
    /// `%APPDATA%`), falling back to `~/.local/share` and finally the working
    /// directory.
    pub fn resolve() -> Self {
        let base = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::under(base.join(APP_DIR))
    }

    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join("data"),
            models: root.join("models"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.data, &self.models] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Absolute paths pass through; anything else is taken relative to the
    /// models directory.
    pub fn model_path(&self, value: &str) -> PathBuf {
        let p = Path::new(value);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.models.join(p)
        }
    }
}
