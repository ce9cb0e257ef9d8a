//! Container lifecycle: create, spawn, transfer, kill, destroy.

use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use chef_common::{generate_container_id, validate_container_id, AccessMask};
use chef_lsm::PathPolicyManager;
use chef_policy::{Policy, PolicyProfile};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::layers::{self, Layer, LayerContext};
use crate::sandbox::{InitRequest, InitResponse, SandboxInit};
use crate::{ContainerError, Result};

/// Capability subset grantable to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// File transfer across the container boundary.
    pub const FILESYSTEM: Capabilities = Capabilities(0x1);
    /// Signalling processes inside the container.
    pub const PROCESS_CONTROL: Capabilities = Capabilities(0x2);
    /// Shared host IPC namespace.
    pub const IPC: Capabilities = Capabilities(0x4);

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    New,
    Composed,
    Running,
    Destroyed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::New => "new",
            ContainerState::Composed => "composed",
            ContainerState::Running => "running",
            ContainerState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Everything needed to create one container.
pub struct ContainerConfig {
    pub id: Option<String>,
    pub layers: Vec<Layer>,
    pub policy: Policy,
    pub caps: Capabilities,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub wait: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnOutcome {
    pub pid: i32,
    /// Exit code when the spawn waited for completion.
    pub exit: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A live container: composed rootfs, sandboxed init, policy, cgroup.
pub struct Container {
    id: String,
    state: ContainerState,
    caps: Capabilities,
    policy: Policy,
    cgroup_id: u64,
    cgroup_path: Option<PathBuf>,
    /// Compiled path profile, consulted for host-mediated file access.
    profile: PolicyProfile,
    // Dropped after init teardown; never released before the container.
    layer_ctx: Option<LayerContext>,
    init: Option<SandboxInit>,
}

impl Container {
    /// Compose the rootfs, project the policy into the kernel, and start
    /// the container init.
    pub fn create(
        config: ContainerConfig,
        work_root: &Path,
        lsm: &mut PathPolicyManager,
    ) -> Result<Self> {
        let id = match config.id {
            Some(id) => {
                validate_container_id(&id)
                    .map_err(|e| ContainerError::InvalidContainerId(e.to_string()))?;
                id
            }
            None => generate_container_id(),
        };

        let profile = config
            .policy
            .compile_profile()
            .map_err(|e| ContainerError::Internal(format!("policy profile: {e}")))?;
        let ctx = layers::compose(&config.layers, &id, work_root)?;
        let mut container = Self {
            id: id.clone(),
            state: ContainerState::Composed,
            caps: config.caps,
            policy: config.policy,
            cgroup_id: 0,
            cgroup_path: None,
            profile,
            layer_ctx: Some(ctx),
            init: None,
        };

        if let Err(e) = container.finish_create(lsm) {
            // Unwind the half-built container before surfacing the error.
            let _ = container.destroy(lsm);
            return Err(e);
        }
        info!(container = %container.id, "container created");
        Ok(container)
    }

    fn finish_create(&mut self, lsm: &mut PathPolicyManager) -> Result<()> {
        let root = self
            .layer_ctx
            .as_ref()
            .expect("composed container has a layer context")
            .root()
            .to_path_buf();

        let (cgroup_path, cgroup_id) = create_cgroup(&self.id);
        self.cgroup_path = cgroup_path;
        self.cgroup_id = cgroup_id;

        // Map entries must land before any process runs inside.
        if lsm.available() {
            lsm.populate(&self.id, &root, &self.policy)
                .map_err(ContainerError::FailedRootfsSetup)?;
        }

        let init = SandboxInit::start(
            &root,
            self.cgroup_path.as_ref().map(|p| p.join("cgroup.procs")),
            &self.policy,
            self.caps,
        )?;
        debug!(container = %self.id, init_pid = init.pid(), "container init started");
        self.init = Some(init);
        self.state = ContainerState::Running;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    pub fn root(&self) -> Option<&Path> {
        self.layer_ctx.as_ref().map(LayerContext::root)
    }

    /// Run `command` inside the container. The command splits at the first
    /// whitespace into program and argument string.
    pub fn spawn(
        &mut self,
        command: &str,
        env: &[String],
        options: SpawnOptions,
    ) -> Result<SpawnOutcome> {
        self.require_running()?;
        let command = command.trim();
        if command.is_empty() {
            return Err(ContainerError::Internal("empty command".to_string()));
        }
        let (program, arguments) = match command.split_once(char::is_whitespace) {
            Some((program, rest)) => (program.to_string(), rest.trim().to_string()),
            None => (command.to_string(), String::new()),
        };

        let init = self.init.as_mut().expect("running container has an init");
        let response = init.request(&InitRequest::Spawn {
            program,
            arguments,
            env: env.to_vec(),
            wait: options.wait,
        })?;
        match response {
            InitResponse::Spawned { pid } => Ok(SpawnOutcome { pid, exit: None }),
            InitResponse::Exited { pid, code } => Ok(SpawnOutcome {
                pid,
                exit: Some(code),
            }),
            InitResponse::Error { message } => Err(ContainerError::Internal(message)),
            other => Err(ContainerError::Internal(format!(
                "unexpected init response: {other:?}"
            ))),
        }
    }

    /// Copy one file across the container boundary.
    pub fn transfer(
        &mut self,
        source: &Path,
        destination: &Path,
        direction: TransferDirection,
    ) -> Result<()> {
        self.require_running()?;
        if !self.caps.contains(Capabilities::FILESYSTEM) {
            return Err(ContainerError::Internal(
                "container lacks the filesystem capability".to_string(),
            ));
        }
        // The in-container side of the copy is subject to the path policy.
        let (inside, required) = match direction {
            TransferDirection::Upload => (destination, AccessMask::WRITE),
            TransferDirection::Download => (source, AccessMask::READ),
        };
        let inside_str = inside.to_string_lossy();
        if !self.profile.check(&inside_str, required) {
            return Err(ContainerError::Internal(format!(
                "policy denies {required} on {inside_str}"
            )));
        }
        let root = self
            .layer_ctx
            .as_ref()
            .expect("running container has a layer context")
            .root();

        let (from, to) = match direction {
            TransferDirection::Upload => (source.to_path_buf(), rebase(root, destination)),
            TransferDirection::Download => (rebase(root, source), destination.to_path_buf()),
        };
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ContainerError::Internal(format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::copy(&from, &to).map_err(|e| {
            ContainerError::Internal(format!(
                "copying {} -> {}: {e}",
                from.display(),
                to.display()
            ))
        })?;

        if direction == TransferDirection::Download {
            adjust_owner_to_invoker(&to);
        }
        Ok(())
    }

    /// Signal a process inside the container.
    pub fn kill(&mut self, pid: i32, signal: i32) -> Result<()> {
        self.require_running()?;
        let init = self.init.as_mut().expect("running container has an init");
        match init.request(&InitRequest::Kill { pid, signal })? {
            InitResponse::Killed => Ok(()),
            InitResponse::Error { message } => Err(ContainerError::Internal(message)),
            other => Err(ContainerError::Internal(format!(
                "unexpected init response: {other:?}"
            ))),
        }
    }

    /// Tear everything down. Every step runs even when an earlier one
    /// fails; the worst error is reported. The caller must already have
    /// removed the container from its registry.
    pub fn destroy(&mut self, lsm: &mut PathPolicyManager) -> Result<()> {
        let mut worst: Option<ContainerError> = None;

        if let Err(e) = lsm.cleanup(&self.id) {
            warn!(container = %self.id, error = %e, "allow-map cleanup failed");
            worst.get_or_insert(ContainerError::Internal(e.to_string()));
        }

        if let Some(init) = self.init.take() {
            if let Err(e) = init.shutdown() {
                warn!(container = %self.id, error = %e, "container init teardown failed");
                worst.get_or_insert(e);
            }
        }

        if let Some(ctx) = self.layer_ctx.take() {
            if let Err(e) = layers::teardown(ctx) {
                warn!(container = %self.id, error = %e, "layer teardown failed");
                worst.get_or_insert(e);
            }
        }

        if let Some(cgroup) = self.cgroup_path.take() {
            if let Err(e) = std::fs::remove_dir(&cgroup) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(container = %self.id, error = %e, "cgroup removal deferred");
                }
            }
        }

        self.state = ContainerState::Destroyed;
        info!(container = %self.id, "container destroyed");
        match worst {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_running(&self) -> Result<()> {
        if self.state != ContainerState::Running {
            return Err(ContainerError::InvalidContainerId(format!(
                "{} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

/// Rebase an absolute in-container path onto the composed root.
fn rebase(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

/// Best-effort per-container cgroup directory; identity comes from its
/// inode.
fn create_cgroup(id: &str) -> (Option<PathBuf>, u64) {
    #[cfg(target_os = "linux")]
    {
        let path = PathBuf::from("/sys/fs/cgroup").join(id);
        if let Err(e) = std::fs::create_dir_all(&path) {
            warn!(container = id, error = %e, "cgroup creation failed, continuing without");
            return (None, 0);
        }
        let inode = std::fs::metadata(&path)
            .map(|meta| {
                use std::os::unix::fs::MetadataExt;
                meta.ino()
            })
            .unwrap_or(0);
        (Some(path), inode)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = id;
        (None, 0)
    }
}

/// Downloads land owned by whoever owns the destination directory, which
/// is the invoking user's tree.
fn adjust_owner_to_invoker(path: &Path) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::MetadataExt;
        let Some(parent) = path.parent() else {
            return;
        };
        let Ok(meta) = std::fs::metadata(parent) else {
            return;
        };
        let uid = nix::unistd::Uid::from_raw(meta.uid());
        let gid = nix::unistd::Gid::from_raw(meta.gid());
        if let Err(e) = nix::unistd::chown(path, Some(uid), Some(gid)) {
            warn!(path = %path.display(), error = %e, "chown after download failed");
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_compose() {
        let caps = Capabilities::FILESYSTEM | Capabilities::IPC;
        assert!(caps.contains(Capabilities::FILESYSTEM));
        assert!(caps.contains(Capabilities::IPC));
        assert!(!caps.contains(Capabilities::PROCESS_CONTROL));
        assert_eq!(Capabilities::NONE.bits(), 0);
    }

    #[test]
    fn rebase_handles_absolute_and_relative() {
        let root = Path::new("/var/chef/containers/c1/root");
        assert_eq!(
            rebase(root, Path::new("/chef/project/main.c")),
            PathBuf::from("/var/chef/containers/c1/root/chef/project/main.c")
        );
        assert_eq!(
            rebase(root, Path::new("build.log")),
            PathBuf::from("/var/chef/containers/c1/root/build.log")
        );
    }

    #[test]
    fn state_display_names() {
        assert_eq!(ContainerState::Running.to_string(), "running");
        assert_eq!(ContainerState::Destroyed.to_string(), "destroyed");
    }
}
