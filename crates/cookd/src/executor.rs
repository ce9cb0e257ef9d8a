//! The per-build executor: accept → source → ingredients → container build
//! → pack → upload → notify.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chef_common::settings::CookdSettings;
use chef_common::{ArtifactKind, BuildStatus, Error, Result};
use chef_container::{Capabilities, Container, ContainerConfig, Layer, SpawnOptions};
use chef_lsm::PathPolicyManager;
use chef_policy::{Policy, PolicyKind};
use tracing::{debug, error, info, warn};

use crate::cache::{package_delta, CacheEntry, CachedIngredient, RecipeCache};
use crate::collaborators::{ArtifactStore, Fridge, IngredientRef, Notifier, SourceFetcher};
use crate::logsink::BuildLogFanout;
use crate::oven::{self, INGREDIENT_DIR, INSTALL_DIR, PROJECT_DIR, TOOLCHAIN_DIR};
use crate::queue::{BuildHandler, BuildRequest};
use crate::recipe::Recipe;
use crate::workspace::BuildWorkspace;

pub struct ExecutorDeps {
    pub notifier: Arc<dyn Notifier>,
    pub fridge: Arc<dyn Fridge>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub fanout: Arc<BuildLogFanout>,
}

pub struct BuildExecutor {
    deps: ExecutorDeps,
    settings: CookdSettings,
    lsm: Mutex<PathPolicyManager>,
    cache: Mutex<RecipeCache>,
}

impl BuildExecutor {
    pub fn new(deps: ExecutorDeps, settings: CookdSettings, lsm: PathPolicyManager) -> Self {
        let cache = RecipeCache::load(settings.build_root.join("recipe-cache.json"));
        Self {
            deps,
            settings,
            lsm: Mutex::new(lsm),
            cache: Mutex::new(cache),
        }
    }

    fn notify(&self, id: &str, status: BuildStatus) {
        self.deps.notifier.build_status(id, status);
    }

    /// Steps 1-10 of a build; uploads and the final status stay in
    /// `execute` so they run on every path.
    fn run(&self, request: &BuildRequest, workspace: &BuildWorkspace) -> Result<()> {
        let id = &request.id;

        // Sources.
        self.deps.fetcher.download(&request.url, &workspace.image())?;
        self.deps
            .fetcher
            .remote_unpack(&workspace.image(), &workspace.sources())?;
        if let Err(e) = std::fs::remove_file(workspace.image()) {
            warn!(build = %id, error = %e, "could not remove source image");
        }

        // Recipe.
        let recipe_path = workspace.sources().join(&request.recipe_path);
        let (recipe, recipe_bytes) = Recipe::load(&recipe_path)?;
        if !recipe.supports_platform(&request.platform) {
            return Err(Error::invalid_argument(format!(
                "recipe does not support platform {}",
                request.platform
            )));
        }

        // Cache lookup gates the ingredient setup.
        let cache_key = RecipeCache::key(&recipe_bytes, &request.platform, &request.architecture);
        let mut entry = self
            .cache
            .lock()
            .map_err(|_| Error::internal("recipe cache mutex poisoned"))?
            .entry(&cache_key);

        if !entry.setup_ingredients {
            entry.ingredients = self.ensure_ingredients(&recipe, request)?;
            entry.setup_ingredients = true;
            self.store_cache(&cache_key, entry.clone())?;
        } else {
            debug!(build = %id, "ingredient setup already cached, skipping");
        }

        // Container.
        let mut layers = vec![Layer::base_rootfs(&self.settings.rootfs)];
        for ingredient in &entry.ingredients {
            layers.push(Layer::vafs_package(&ingredient.archive, &ingredient.target));
        }
        layers.push(Layer::host_directory(
            workspace.sources(),
            PROJECT_DIR,
            false,
        ));

        let mut policy = Policy::new(PolicyKind::Build);
        policy.add_path("/chef", chef_common::AccessMask::ALL)?;

        let mut active = self.create_container(layers, policy)?;
        let container = active.container();

        // OS packages: apt-style add/remove, delta only.
        let (added, removed) =
            package_delta(&entry.packages, &recipe.environment.host.packages);
        install_package_delta(container, id, &added, &removed)?;
        entry.packages = recipe.environment.host.packages.clone();

        // Setup hook, once per cache key.
        if let Some(setup) = recipe.environment.hooks.setup.as_deref() {
            if entry.setup_hook_run {
                debug!(build = %id, "setup hook already ran for this recipe");
            } else {
                run_setup_hook(container, id, &workspace.sources(), setup)?;
                entry.setup_hook_run = true;
            }
        }

        self.store_cache(&cache_key, entry)?;

        // Build phases.
        self.notify(id, BuildStatus::Building);
        for part in &recipe.parts {
            if let Some(toolchain) = recipe.toolchain_for(part, &request.platform) {
                debug!(build = %id, part = %part.name, toolchain, "part toolchain resolved");
            }
            for (index, step) in part.steps.iter().enumerate() {
                oven::bake_step(container, id, &workspace.sources(), part, index, step)?;
            }
        }

        // Pack.
        self.notify(id, BuildStatus::Packing);
        let root = container
            .root()
            .ok_or_else(|| Error::internal("running container lost its root"))?
            .to_path_buf();
        pack_outputs(&root, &workspace.pack_path())?;

        active.destroy()?;
        Ok(())
    }

    /// Resolve every ingredient the recipe needs onto its in-container
    /// directory.
    fn ensure_ingredients(
        &self,
        recipe: &Recipe,
        request: &BuildRequest,
    ) -> Result<Vec<CachedIngredient>> {
        let mut resolved = Vec::new();

        for part in &recipe.parts {
            if let Some(toolchain) = recipe.toolchain_for(part, &request.platform) {
                let target = format!("{TOOLCHAIN_DIR}/{toolchain}");
                if !resolved
                    .iter()
                    .any(|have: &CachedIngredient| have.target.as_path() == Path::new(&target))
                {
                    self.ensure_one(request, &mut resolved, toolchain, "stable", None, target)?;
                }
            }
        }
        for ingredient in &recipe.environment.host.ingredients {
            self.ensure_one(
                request,
                &mut resolved,
                &ingredient.name,
                &ingredient.channel,
                ingredient.version.as_deref(),
                format!("{INGREDIENT_DIR}/host/{}", ingredient.name),
            )?;
        }
        for ingredient in &recipe.environment.build.ingredients {
            self.ensure_one(
                request,
                &mut resolved,
                &ingredient.name,
                &ingredient.channel,
                ingredient.version.as_deref(),
                format!("{INGREDIENT_DIR}/build/{}", ingredient.name),
            )?;
        }
        for ingredient in &recipe.environment.runtime.ingredients {
            self.ensure_one(
                request,
                &mut resolved,
                &ingredient.name,
                &ingredient.channel,
                ingredient.version.as_deref(),
                format!("{INGREDIENT_DIR}/runtime/{}", ingredient.name),
            )?;
        }
        info!(count = resolved.len(), "ingredients ensured");
        Ok(resolved)
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_one(
        &self,
        request: &BuildRequest,
        resolved: &mut Vec<CachedIngredient>,
        name: &str,
        channel: &str,
        version: Option<&str>,
        target: String,
    ) -> Result<()> {
        let reference = IngredientRef {
            name: name.to_string(),
            channel: channel.to_string(),
            version: version.map(str::to_string),
            arch: request.architecture.clone(),
            platform: request.platform.clone(),
        };
        let archive = self.deps.fridge.ensure(&reference)?;
        resolved.push(CachedIngredient {
            archive,
            target: target.into(),
        });
        Ok(())
    }

    fn create_container(&self, layers: Vec<Layer>, policy: Policy) -> Result<ActiveContainer<'_>> {
        let mut lsm = self
            .lsm
            .lock()
            .map_err(|_| Error::internal("lsm manager mutex poisoned"))?;
        let container = Container::create(
            ContainerConfig {
                id: None,
                layers,
                policy,
                caps: Capabilities::FILESYSTEM | Capabilities::PROCESS_CONTROL,
            },
            &self.settings.build_root,
            &mut lsm,
        )
        .map_err(chef_common::Error::from)?;
        drop(lsm);
        Ok(ActiveContainer {
            container: Some(container),
            lsm: &self.lsm,
        })
    }

    fn store_cache(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.cache
            .lock()
            .map_err(|_| Error::internal("recipe cache mutex poisoned"))?
            .store(key, entry)
    }
}

impl BuildHandler for BuildExecutor {
    fn execute(&self, request: BuildRequest) {
        let id = request.id.clone();
        self.notify(&id, BuildStatus::Sourcing);

        let workspace = match BuildWorkspace::create(&self.settings.build_root, &id) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(build = %id, error = %e, "could not create build workspace");
                self.notify(&id, BuildStatus::Failed);
                return;
            }
        };
        if let Err(e) = self.deps.fanout.open(&id, &workspace.log_path()) {
            warn!(build = %id, error = %e, "per-build log sink unavailable");
        }

        let outcome = self.run(&request, &workspace);
        let mut failed = outcome.is_err();
        if let Err(e) = &outcome {
            error!(build = %id, error = %e, "build failed");
        }

        // The log uploads whenever possible; its failure never fails the
        // build. A pack that exists but cannot be delivered does.
        self.deps.fanout.close(&id);
        match self.deps.artifacts.upload(&id, &workspace.log_path()) {
            Ok(uri) => self.deps.notifier.artifact_ready(&id, ArtifactKind::Log, &uri),
            Err(e) => warn!(build = %id, error = %e, "log upload failed"),
        }
        if workspace.pack_path().exists() {
            match self.deps.artifacts.upload(&id, &workspace.pack_path()) {
                Ok(uri) => self
                    .deps
                    .notifier
                    .artifact_ready(&id, ArtifactKind::Package, &uri),
                Err(e) => {
                    warn!(build = %id, error = %e, "pack upload failed");
                    failed = true;
                }
            }
        }

        let final_status = if failed {
            BuildStatus::Failed
        } else {
            BuildStatus::Done
        };
        info!(build = %id, status = ?final_status, "build finished");
        self.notify(&id, final_status);
    }
}

/// Holds a live container and guarantees destruction on every exit path.
struct ActiveContainer<'a> {
    container: Option<Container>,
    lsm: &'a Mutex<PathPolicyManager>,
}

impl ActiveContainer<'_> {
    fn container(&mut self) -> &mut Container {
        self.container.as_mut().expect("container not yet destroyed")
    }

    fn destroy(&mut self) -> Result<()> {
        let Some(mut container) = self.container.take() else {
            return Ok(());
        };
        let mut lsm = self
            .lsm
            .lock()
            .map_err(|_| Error::internal("lsm manager mutex poisoned"))?;
        container.destroy(&mut lsm).map_err(chef_common::Error::from)
    }
}

impl Drop for ActiveContainer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(error = %e, "container teardown failed during build cleanup");
        }
    }
}

fn install_package_delta(
    container: &mut Container,
    build_id: &str,
    added: &[String],
    removed: &[String],
) -> Result<()> {
    if !added.is_empty() {
        let command = format!("apt-get install -y {}", added.join(" "));
        run_in_container(container, build_id, &command)?;
    }
    if !removed.is_empty() {
        let command = format!("apt-get remove -y {}", removed.join(" "));
        run_in_container(container, build_id, &command)?;
    }
    Ok(())
}

fn run_setup_hook(
    container: &mut Container,
    build_id: &str,
    sources_host: &Path,
    hook: &str,
) -> Result<()> {
    let host_path = sources_host.join(".chef-setup.sh");
    std::fs::write(&host_path, format!("#!/bin/bash\nset -e\n{hook}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755))?;
    }
    info!(build = build_id, "running setup hook");
    run_in_container(
        container,
        build_id,
        &format!("/bin/bash {PROJECT_DIR}/.chef-setup.sh"),
    )
}

fn run_in_container(container: &mut Container, build_id: &str, command: &str) -> Result<()> {
    debug!(build = build_id, command, "running container command");
    let env = vec!["PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string()];
    let outcome = container
        .spawn(command, &env, SpawnOptions { wait: true })
        .map_err(chef_common::Error::from)?;
    match outcome.exit {
        Some(0) => Ok(()),
        other => Err(Error::internal(format!(
            "command {command:?} exited with {other:?}"
        ))),
    }
}

/// Pack the container's install root into the workspace. A missing or
/// empty install tree produces no pack, which is not an error.
fn pack_outputs(container_root: &Path, pack_path: &Path) -> Result<bool> {
    let install = container_root.join(INSTALL_DIR.trim_start_matches('/'));
    let has_output = std::fs::read_dir(&install)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if !has_output {
        debug!("no install outputs, skipping pack");
        return Ok(false);
    }
    let status = std::process::Command::new("tar")
        .arg("-czf")
        .arg(pack_path)
        .arg("-C")
        .arg(&install)
        .arg(".")
        .status()?;
    if !status.success() {
        return Err(Error::internal(format!("packing exited with {status}")));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalArtifactStore;
    use chef_common::settings::CookdSettings;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct EventLog {
        events: StdMutex<Vec<String>>,
    }

    impl EventLog {
        fn entries(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Notifier for EventLog {
        fn build_status(&self, id: &str, status: BuildStatus) {
            self.events
                .lock()
                .unwrap()
                .push(format!("status:{id}:{status:?}"));
        }

        fn artifact_ready(&self, id: &str, kind: ArtifactKind, uri: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("artifact:{id}:{kind:?}:{uri}"));
        }
    }

    struct FailingFetcher;

    impl SourceFetcher for FailingFetcher {
        fn download(&self, url: &str, _dest: &Path) -> chef_common::Result<()> {
            Err(Error::internal(format!("no route to {url}")))
        }

        fn remote_unpack(&self, _image: &Path, _dest: &Path) -> chef_common::Result<()> {
            unreachable!("download always fails first")
        }
    }

    struct EmptyFridge;

    impl Fridge for EmptyFridge {
        fn ensure(&self, ingredient: &IngredientRef) -> chef_common::Result<PathBuf> {
            Err(Error::NotFound(ingredient.name.clone()))
        }
    }

    fn executor_with(
        notifier: Arc<EventLog>,
        fetcher: Arc<dyn SourceFetcher>,
        build_root: &Path,
    ) -> BuildExecutor {
        let settings = CookdSettings {
            build_root: build_root.to_path_buf(),
            ..CookdSettings::default()
        };
        BuildExecutor::new(
            ExecutorDeps {
                notifier,
                fridge: Arc::new(EmptyFridge),
                fetcher,
                artifacts: Arc::new(LocalArtifactStore::new(build_root.join("artifacts"))),
                fanout: BuildLogFanout::new(),
            },
            settings,
            PathPolicyManager::unavailable(),
        )
    }

    fn request() -> BuildRequest {
        BuildRequest {
            id: "b-1".to_string(),
            url: "https://example.invalid/src.img".to_string(),
            recipe_path: "recipe.json".to_string(),
            platform: "linux".to_string(),
            architecture: "x86_64".to_string(),
        }
    }

    #[test]
    fn failed_source_fetch_still_resolves_to_exactly_one_final_status() {
        let dir = tempdir().unwrap();
        let notifier = Arc::new(EventLog::default());
        let executor = executor_with(notifier.clone(), Arc::new(FailingFetcher), dir.path());

        executor.execute(request());

        let events = notifier.entries();
        assert_eq!(events.first().unwrap(), "status:b-1:Sourcing");
        assert_eq!(events.last().unwrap(), "status:b-1:Failed");
        let finals = events
            .iter()
            .filter(|event| event.contains(":Done") || event.contains(":Failed"))
            .count();
        assert_eq!(finals, 1, "exactly one terminal status");
    }

    #[test]
    fn log_artifact_event_precedes_the_final_status() {
        let dir = tempdir().unwrap();
        let notifier = Arc::new(EventLog::default());
        let executor = executor_with(notifier.clone(), Arc::new(FailingFetcher), dir.path());

        executor.execute(request());

        let events = notifier.entries();
        let log_pos = events
            .iter()
            .position(|event| event.starts_with("artifact:b-1:Log"))
            .expect("log artifact uploaded even for failed builds");
        let final_pos = events
            .iter()
            .position(|event| event.ends_with(":Failed"))
            .unwrap();
        assert!(log_pos < final_pos);
    }

    #[test]
    fn workspace_is_removed_on_failure_paths() {
        let dir = tempdir().unwrap();
        let notifier = Arc::new(EventLog::default());
        let executor = executor_with(notifier, Arc::new(FailingFetcher), dir.path());
        executor.execute(request());
        assert!(
            !dir.path().join("b-1").exists(),
            "scratch tree must not survive the build"
        );
    }

    #[test]
    fn pack_outputs_skips_empty_install_trees() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("chef/install")).unwrap();
        let pack = dir.path().join("pack.vafs");
        assert!(!pack_outputs(&root, &pack).unwrap());
        assert!(!pack.exists());
    }

    #[test]
    fn pack_outputs_archives_populated_trees() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let install = root.join("chef/install");
        std::fs::create_dir_all(install.join("bin")).unwrap();
        std::fs::write(install.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        let pack = dir.path().join("pack.vafs");
        assert!(pack_outputs(&root, &pack).unwrap());
        assert!(pack.exists());
    }
}
