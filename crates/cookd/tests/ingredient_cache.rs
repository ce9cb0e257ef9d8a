//! Repeated builds of identical sources reuse the cached ingredient setup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chef_common::settings::CookdSettings;
use chef_common::{ArtifactKind, BuildStatus};
use chef_lsm::PathPolicyManager;
use cookd::collaborators::{ArtifactStore, Fridge, IngredientRef, Notifier, SourceFetcher};
use cookd::executor::{BuildExecutor, ExecutorDeps};
use cookd::logsink::BuildLogFanout;
use cookd::queue::{BuildHandler, BuildRequest};
use tempfile::tempdir;

const RECIPE: &str = r#"{
    "environment": {
        "host": { "ingredients": [ { "name": "cmake" } ] },
        "build": { "ingredients": [ { "name": "zlib", "version": "1.3" } ] }
    },
    "parts": []
}"#;

/// Unpacks a fixed recipe instead of talking to the network.
struct StubFetcher;

impl SourceFetcher for StubFetcher {
    fn download(&self, _url: &str, dest: &Path) -> chef_common::Result<()> {
        std::fs::write(dest, b"image")?;
        Ok(())
    }

    fn remote_unpack(&self, _image: &Path, dest: &Path) -> chef_common::Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("recipe.json"), RECIPE)?;
        Ok(())
    }
}

struct CountingFridge {
    calls: AtomicUsize,
    archive: PathBuf,
}

impl Fridge for CountingFridge {
    fn ensure(&self, _ingredient: &IngredientRef) -> chef_common::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.archive.clone())
    }
}

#[derive(Default)]
struct StatusLog {
    finals: Mutex<Vec<BuildStatus>>,
}

impl Notifier for StatusLog {
    fn build_status(&self, _id: &str, status: BuildStatus) {
        if status.is_terminal() {
            self.finals.lock().unwrap().push(status);
        }
    }

    fn artifact_ready(&self, _id: &str, _kind: ArtifactKind, _uri: &str) {}
}

struct NullStore;

impl ArtifactStore for NullStore {
    fn upload(&self, build_id: &str, path: &Path) -> chef_common::Result<String> {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        Ok(format!("chef://artifacts/{build_id}/{name}"))
    }
}

fn request(id: &str) -> BuildRequest {
    BuildRequest {
        id: id.to_string(),
        url: "https://example.invalid/src.img".to_string(),
        recipe_path: "recipe.json".to_string(),
        platform: "linux".to_string(),
        architecture: "x86_64".to_string(),
    }
}

#[test]
fn second_build_skips_ingredient_setup() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("stub.vafs");
    std::fs::write(&archive, b"archive").unwrap();

    let fridge = Arc::new(CountingFridge {
        calls: AtomicUsize::new(0),
        archive,
    });
    let notifier = Arc::new(StatusLog::default());
    let settings = CookdSettings {
        build_root: dir.path().join("builds"),
        ..CookdSettings::default()
    };
    std::fs::create_dir_all(&settings.build_root).unwrap();

    let executor = BuildExecutor::new(
        ExecutorDeps {
            notifier: Arc::clone(&notifier) as _,
            fridge: Arc::clone(&fridge) as _,
            fetcher: Arc::new(StubFetcher),
            artifacts: Arc::new(NullStore),
            fanout: BuildLogFanout::new(),
        },
        settings,
        PathPolicyManager::unavailable(),
    );

    executor.execute(request("b-1"));
    let after_first = fridge.calls.load(Ordering::SeqCst);
    // Two ingredients in the recipe, each ensured exactly once.
    assert_eq!(after_first, 2);

    executor.execute(request("b-2"));
    assert_eq!(
        fridge.calls.load(Ordering::SeqCst),
        after_first,
        "cached setup must skip the fridge entirely"
    );

    // Every build resolved to exactly one terminal status.
    assert_eq!(notifier.finals.lock().unwrap().len(), 2);
}
