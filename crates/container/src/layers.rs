//! Ordered root filesystem composition.
//!
//! Layers materialize bottom-up into a scratch root; later layers shadow
//! earlier ones. Composition records every mount it makes so a mid-compose
//! failure unwinds completely before the error returns.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ContainerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LayerKind {
    /// The base distribution tree; must be the first layer.
    BaseRootfs { path: PathBuf },
    /// A read-only package archive unpacked in place.
    VafsPackage { path: PathBuf },
    /// A host directory bind-mounted into the container.
    HostDirectory { path: PathBuf },
    /// An overlay of `upper` stacked onto `lower`.
    Overlay { upper: PathBuf, lower: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(flatten)]
    pub kind: LayerKind,
    /// Absolute mount point inside the container.
    pub target: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

impl Layer {
    pub fn base_rootfs(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: LayerKind::BaseRootfs { path: path.into() },
            target: PathBuf::from("/"),
            readonly: false,
        }
    }

    pub fn host_directory(
        path: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        readonly: bool,
    ) -> Self {
        Self {
            kind: LayerKind::HostDirectory { path: path.into() },
            target: target.into(),
            readonly,
        }
    }

    pub fn vafs_package(path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            kind: LayerKind::VafsPackage { path: path.into() },
            target: target.into(),
            readonly: true,
        }
    }
}

/// Exactly one `BaseRootfs`, at position 0; all targets absolute.
pub fn validate_layers(layers: &[Layer]) -> Result<()> {
    if layers.is_empty() {
        return Err(ContainerError::InvalidMounts("no layers given".to_string()));
    }
    let base_count = layers
        .iter()
        .filter(|layer| matches!(layer.kind, LayerKind::BaseRootfs { .. }))
        .count();
    if base_count != 1 {
        return Err(ContainerError::InvalidMounts(format!(
            "expected exactly one base rootfs layer, found {base_count}"
        )));
    }
    if !matches!(layers[0].kind, LayerKind::BaseRootfs { .. }) {
        return Err(ContainerError::InvalidMounts(
            "the base rootfs layer must come first".to_string(),
        ));
    }
    for layer in layers {
        if !layer.target.is_absolute() {
            return Err(ContainerError::InvalidMounts(format!(
                "layer target {} is not absolute",
                layer.target.display()
            )));
        }
    }
    Ok(())
}

/// One materialized mount, remembered for reverse-order unwinding.
#[derive(Debug)]
enum MountHandle {
    Bind(PathBuf),
    Overlay(PathBuf),
    Unpacked(PathBuf),
}

/// The composed rootfs and everything needed to take it apart again.
#[derive(Debug)]
pub struct LayerContext {
    root: PathBuf,
    work_dir: PathBuf,
    mounts: Vec<MountHandle>,
}

impl LayerContext {
    /// Path of the composed root on the host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }
}

/// Compose `layers` for `container_id` under `base_dir`.
#[cfg(target_os = "linux")]
pub fn compose(layers: &[Layer], container_id: &str, base_dir: &Path) -> Result<LayerContext> {
    validate_layers(layers)?;

    let work_dir = base_dir.join(container_id);
    let root = work_dir.join("root");
    std::fs::create_dir_all(&root)
        .map_err(|e| ContainerError::FailedRootfsSetup(e.into()))?;

    let mut ctx = LayerContext {
        root: root.clone(),
        work_dir: work_dir.clone(),
        mounts: Vec::new(),
    };

    for (index, layer) in layers.iter().enumerate() {
        if let Err(e) = linux::materialize(&mut ctx, layer, index) {
            warn!(
                container = container_id,
                layer = index,
                error = %e,
                "layer composition failed, unwinding"
            );
            unwind(&mut ctx);
            let _ = std::fs::remove_dir_all(&ctx.work_dir);
            return Err(e);
        }
    }

    debug!(
        container = container_id,
        mounts = ctx.mounts.len(),
        root = %ctx.root.display(),
        "rootfs composed"
    );
    Ok(ctx)
}

#[cfg(not(target_os = "linux"))]
pub fn compose(layers: &[Layer], _container_id: &str, _base_dir: &Path) -> Result<LayerContext> {
    validate_layers(layers)?;
    Err(ContainerError::FailedRootfsSetup(
        chef_common::Error::Unavailable("layer composition requires Linux".to_string()),
    ))
}

/// Unwind in reverse order, detach mounts, remove temp paths. Best effort:
/// every step runs even when an earlier one fails.
pub fn teardown(mut ctx: LayerContext) -> Result<()> {
    let failed = unwind(&mut ctx);
    if let Err(e) = std::fs::remove_dir_all(&ctx.work_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %ctx.work_dir.display(), error = %e, "failed to remove work dir");
            return Err(ContainerError::FailedRootfsSetup(e.into()));
        }
    }
    if failed {
        return Err(ContainerError::Internal(
            "one or more mounts could not be detached".to_string(),
        ));
    }
    Ok(())
}

fn unwind(ctx: &mut LayerContext) -> bool {
    let mut failed = false;
    while let Some(mount) = ctx.mounts.pop() {
        match mount {
            MountHandle::Bind(path) | MountHandle::Overlay(path) => {
                #[cfg(target_os = "linux")]
                if let Err(e) = nix::mount::umount2(&path, nix::mount::MntFlags::MNT_DETACH) {
                    warn!(path = %path.display(), error = %e, "detach failed");
                    failed = true;
                }
                #[cfg(not(target_os = "linux"))]
                let _ = path;
            }
            MountHandle::Unpacked(path) => {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "unpacked layer removal failed");
                        failed = true;
                    }
                }
            }
        }
    }
    failed
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::{Path, PathBuf};
    use std::process::Command;

    use nix::mount::{mount, MsFlags};

    use super::{ContainerError, Layer, LayerContext, LayerKind, MountHandle, Result};

    pub(super) fn materialize(ctx: &mut LayerContext, layer: &Layer, index: usize) -> Result<()> {
        let target = target_path(&ctx.root, &layer.target)?;
        std::fs::create_dir_all(&target)
            .map_err(|e| ContainerError::FailedRootfsSetup(e.into()))?;

        match &layer.kind {
            LayerKind::BaseRootfs { path } | LayerKind::HostDirectory { path } => {
                bind_mount(path, &target, layer.readonly)?;
                ctx.mounts.push(MountHandle::Bind(target));
            }
            LayerKind::VafsPackage { path } => {
                unpack_archive(path, &target)?;
                // Removal must come after the detach on unwind, so the
                // unpacked handle is recorded first.
                ctx.mounts.push(MountHandle::Unpacked(target.clone()));
                if layer.readonly {
                    // Bind the directory over itself so it can be remounted
                    // read-only.
                    bind_mount(&target, &target, true)?;
                    ctx.mounts.push(MountHandle::Bind(target));
                }
            }
            LayerKind::Overlay { upper, lower } => {
                let work = ctx.work_dir.join(format!("ovl-{index}-work"));
                std::fs::create_dir_all(&work)
                    .map_err(|e| ContainerError::FailedRootfsSetup(e.into()))?;
                overlay_mount(upper, lower, &work, &target, layer.readonly)?;
                ctx.mounts.push(MountHandle::Overlay(target));
            }
        }
        Ok(())
    }

    fn target_path(root: &Path, target: &Path) -> Result<PathBuf> {
        let relative = target
            .strip_prefix("/")
            .map_err(|_| ContainerError::InvalidMounts(format!(
                "layer target {} is not absolute",
                target.display()
            )))?;
        Ok(root.join(relative))
    }

    fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|errno| {
            ContainerError::FailedRootfsSetup(chef_common::Error::from_errno(
                errno as i32,
                &format!("bind {} -> {}", source.display(), target.display()),
            ))
        })?;

        if readonly {
            // Second step required for the read-only flag to stick.
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|errno| {
                ContainerError::FailedRootfsSetup(chef_common::Error::from_errno(
                    errno as i32,
                    &format!("remount ro {}", target.display()),
                ))
            })?;
        }
        Ok(())
    }

    fn overlay_mount(
        upper: &Path,
        lower: &Path,
        work: &Path,
        target: &Path,
        readonly: bool,
    ) -> Result<()> {
        let options = if readonly {
            format!("lowerdir={}:{}", upper.display(), lower.display())
        } else {
            std::fs::create_dir_all(upper)
                .map_err(|e| ContainerError::FailedRootfsSetup(e.into()))?;
            format!(
                "lowerdir={},upperdir={},workdir={}",
                lower.display(),
                upper.display(),
                work.display()
            )
        };
        let flags = if readonly {
            MsFlags::MS_RDONLY
        } else {
            MsFlags::empty()
        };
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            flags,
            Some(options.as_str()),
        )
        .map_err(|errno| {
            ContainerError::FailedRootfsSetup(chef_common::Error::from_errno(
                errno as i32,
                &format!("overlay on {}", target.display()),
            ))
        })
    }

    /// Package layers arrive as read-only archives; unpack via tar, which
    /// every build host carries.
    fn unpack_archive(archive: &Path, target: &Path) -> Result<()> {
        let status = Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(target)
            .status()
            .map_err(|e| ContainerError::FailedRootfsSetup(e.into()))?;
        if !status.success() {
            return Err(ContainerError::FailedRootfsSetup(
                chef_common::Error::internal(format!(
                    "unpacking {} exited with {status}",
                    archive.display()
                )),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Layer {
        Layer::base_rootfs("/srv/rootfs/base")
    }

    #[test]
    fn empty_layer_list_is_rejected() {
        assert!(matches!(
            validate_layers(&[]),
            Err(ContainerError::InvalidMounts(_))
        ));
    }

    #[test]
    fn base_rootfs_must_come_first() {
        let layers = vec![
            Layer::host_directory("/opt/tools", "/chef/tools", true),
            base(),
        ];
        assert!(matches!(
            validate_layers(&layers),
            Err(ContainerError::InvalidMounts(_))
        ));
    }

    #[test]
    fn exactly_one_base_rootfs() {
        let layers = vec![base(), base()];
        assert!(matches!(
            validate_layers(&layers),
            Err(ContainerError::InvalidMounts(_))
        ));

        let layers = vec![Layer::host_directory("/opt", "/opt", true)];
        assert!(matches!(
            validate_layers(&layers),
            Err(ContainerError::InvalidMounts(_))
        ));
    }

    #[test]
    fn relative_targets_are_rejected() {
        let mut layer = Layer::host_directory("/opt/tools", "chef/tools", true);
        layer.target = PathBuf::from("chef/tools");
        let layers = vec![base(), layer];
        assert!(matches!(
            validate_layers(&layers),
            Err(ContainerError::InvalidMounts(_))
        ));
    }

    #[test]
    fn well_formed_stack_validates() {
        let layers = vec![
            base(),
            Layer::vafs_package("/fridge/gcc-13.vafs", "/chef/ingredients/gcc"),
            Layer::host_directory("/var/chef/builds/b1/sources", "/chef/project", false),
            Layer {
                kind: LayerKind::Overlay {
                    upper: PathBuf::from("/var/chef/builds/b1/upper"),
                    lower: PathBuf::from("/srv/rootfs/base/usr"),
                },
                target: PathBuf::from("/usr"),
                readonly: false,
            },
        ];
        validate_layers(&layers).unwrap();
    }

    #[test]
    fn layer_wire_shape_round_trips() {
        let layer = Layer::vafs_package("/fridge/zlib.vafs", "/chef/ingredients/zlib");
        let json = serde_json::to_value(&layer).unwrap();
        assert_eq!(json["kind"], "vafs-package");
        assert_eq!(json["readonly"], true);
        let back: Layer = serde_json::from_value(json).unwrap();
        assert_eq!(back, layer);
    }
}
