//! Per-build scratch tree: `<build-root>/<id>/{src.image, sources/,
//! build.log, pack.vafs, containers/}`. Purely local scratch, removed on
//! every exit path.

use std::path::{Path, PathBuf};

use chef_common::Result;
use tracing::warn;

pub struct BuildWorkspace {
    id: String,
    root: PathBuf,
}

impl BuildWorkspace {
    pub fn create(build_root: &Path, id: &str) -> Result<Self> {
        let root = build_root.join(id);
        std::fs::create_dir_all(root.join("sources"))?;
        std::fs::create_dir_all(root.join("containers"))?;
        Ok(Self {
            id: id.to_string(),
            root,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sources(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn image(&self) -> PathBuf {
        self.root.join("src.image")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("build.log")
    }

    pub fn pack_path(&self) -> PathBuf {
        self.root.join("pack.vafs")
    }

    /// Base directory for this build's container composition.
    pub fn container_root(&self) -> PathBuf {
        self.root.join("containers")
    }
}

impl Drop for BuildWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(build = %self.id, error = %e, "failed to remove build workspace");
            }
        }
    }
}
