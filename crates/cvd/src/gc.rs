//! Startup sweep of orphaned container work directories.
//!
//! A previous daemon run that died mid-build leaves composed trees under
//! the work root. The registry starts empty, so everything found here is
//! orphaned. Best effort: stale mounts are detached before removal, and
//! directories that still refuse to go are reported, not fatal.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub errors: Vec<String>,
}

pub fn sweep(work_root: &Path) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            report
                .errors
                .push(format!("reading {}: {e}", work_root.display()));
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        detach_stale_mounts(&path);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed orphaned container tree");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "orphaned tree not removable");
                report.errors.push(format!("{}: {e}", path.display()));
                report.kept.push(path);
            }
        }
    }

    info!(
        removed = report.removed.len(),
        kept = report.kept.len(),
        errors = report.errors.len(),
        "startup sweep complete"
    );
    report
}

/// Detach anything still mounted under an orphaned root.
fn detach_stale_mounts(path: &Path) {
    #[cfg(target_os = "linux")]
    {
        let root = path.join("root");
        if !root.exists() {
            return;
        }
        // Deepest mounts first: walk the tree bottom-up.
        let mut stack = vec![root.clone()];
        let mut ordered = Vec::new();
        while let Some(dir) = stack.pop() {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let child = entry.path();
                    if child.is_dir() {
                        stack.push(child);
                    }
                }
            }
            ordered.push(dir);
        }
        for dir in ordered.iter().rev() {
            let ret = unsafe {
                let c_path = match std::ffi::CString::new(dir.as_os_str().as_encoded_bytes()) {
                    Ok(c_path) => c_path,
                    Err(_) => continue,
                };
                libc::umount2(c_path.as_ptr(), libc::MNT_DETACH)
            };
            if ret == 0 {
                debug!(path = %dir.display(), "detached stale mount");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = path;
}
