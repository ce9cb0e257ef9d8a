//! Seams to the cook daemon's external collaborators: the ingredient
//! fridge, source fetching, artifact storage, and orchestrator
//! notifications. The default implementations are thin local ones; the RPC
//! transport swaps its own in at daemon init.

use std::path::{Path, PathBuf};
use std::process::Command;

use chef_common::{ArtifactKind, BuildStatus, Error, Result};
use tracing::debug;

/// A fully-resolved ingredient reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientRef {
    pub name: String,
    pub channel: String,
    pub version: Option<String>,
    pub arch: String,
    pub platform: String,
}

/// The package fridge: resolves an ingredient to a local archive path,
/// fetching it if necessary.
pub trait Fridge: Send + Sync {
    fn ensure(&self, ingredient: &IngredientRef) -> Result<PathBuf>;
}

/// Source image download and unpack.
pub trait SourceFetcher: Send + Sync {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
    fn remote_unpack(&self, image: &Path, dest: &Path) -> Result<()>;
}

/// Artifact upload; returns the stored artifact's URI.
pub trait ArtifactStore: Send + Sync {
    fn upload(&self, build_id: &str, path: &Path) -> Result<String>;
}

/// Status and artifact events back to the orchestrator.
pub trait Notifier: Send + Sync {
    fn build_status(&self, id: &str, status: BuildStatus);
    fn artifact_ready(&self, id: &str, kind: ArtifactKind, uri: &str);
}

/// Fridge over a local store laid out as
/// `<root>/<name>/<channel>/<version>/<name>-<arch>-<platform>.vafs`.
pub struct LocalFridge {
    root: PathBuf,
}

impl LocalFridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Fridge for LocalFridge {
    fn ensure(&self, ingredient: &IngredientRef) -> Result<PathBuf> {
        let version = ingredient.version.as_deref().unwrap_or("latest");
        let path = self
            .root
            .join(&ingredient.name)
            .join(&ingredient.channel)
            .join(version)
            .join(format!(
                "{}-{}-{}.vafs",
                ingredient.name, ingredient.arch, ingredient.platform
            ));
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "ingredient {}/{}/{} for {}/{}",
                ingredient.name, ingredient.channel, version, ingredient.platform,
                ingredient.arch
            )));
        }
        debug!(ingredient = %ingredient.name, path = %path.display(), "ingredient resolved");
        Ok(path)
    }
}

/// Fetcher shelling out to the host's transfer tools.
pub struct CommandFetcher;

impl SourceFetcher for CommandFetcher {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let status = Command::new("curl")
            .arg("--fail")
            .arg("--silent")
            .arg("--show-error")
            .arg("--location")
            .arg("--output")
            .arg(dest)
            .arg(url)
            .status()?;
        if !status.success() {
            return Err(Error::internal(format!(
                "downloading {url} exited with {status}"
            )));
        }
        Ok(())
    }

    fn remote_unpack(&self, image: &Path, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let status = Command::new("tar")
            .arg("-xf")
            .arg(image)
            .arg("-C")
            .arg(dest)
            .status()?;
        if !status.success() {
            return Err(Error::internal(format!(
                "unpacking {} exited with {status}",
                image.display()
            )));
        }
        Ok(())
    }
}

/// Artifact store that files uploads under a local directory and hands back
/// `chef://` URIs.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn upload(&self, build_id: &str, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::invalid_argument(format!("{} has no file name", path.display())))?
            .to_string_lossy()
            .into_owned();
        let dir = self.root.join(build_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(path, dir.join(&name))?;
        Ok(format!("chef://artifacts/{build_id}/{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ingredient() -> IngredientRef {
        IngredientRef {
            name: "zlib".to_string(),
            channel: "stable".to_string(),
            version: Some("1.3".to_string()),
            arch: "x86_64".to_string(),
            platform: "linux".to_string(),
        }
    }

    #[test]
    fn fridge_resolves_the_expected_layout() {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join("zlib/stable/1.3/zlib-x86_64-linux.vafs");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"archive").unwrap();

        let fridge = LocalFridge::new(dir.path());
        assert_eq!(fridge.ensure(&ingredient()).unwrap(), path);
    }

    #[test]
    fn missing_ingredient_is_not_found() {
        let dir = tempdir().unwrap();
        let fridge = LocalFridge::new(dir.path());
        assert!(matches!(
            fridge.ensure(&ingredient()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn artifact_store_uris_are_stable() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("build.log");
        std::fs::write(&log, b"log text").unwrap();

        let store = LocalArtifactStore::new(dir.path().join("artifacts"));
        let uri = store.upload("b-7", &log).unwrap();
        assert_eq!(uri, "chef://artifacts/b-7/build.log");
        assert!(dir.path().join("artifacts/b-7/build.log").exists());
    }
}
