//! Load/attach lifecycle and per-container map population.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chef_common::{validate_container_id, Result};
use chef_policy::Policy;
use tracing::{debug, info, warn};

use crate::tracker::ContainerPolicyTracker;
use crate::{lsm_bpf_enabled, PolicyMapKey, PolicyMapValue};

pub const PIN_DIR: &str = "/sys/fs/bpf/chef";
pub const PIN_PATH: &str = "/sys/fs/bpf/chef/cvd_allow_map";

/// Environment override for the compiled LSM object location.
pub const OBJECT_ENV: &str = "CHEF_LSM_OBJECT";
const DEFAULT_OBJECT: &str = "/usr/lib/chef/cvd_lsm.bpf.o";

/// Owner of the process-wide allow-map and the per-container trackers.
///
/// Construction never fails: when the kernel lacks the `bpf` LSM or the
/// program cannot be attached, the manager degrades to a no-op and reports
/// `available() == false`.
pub struct PathPolicyManager {
    #[cfg(target_os = "linux")]
    state: Option<linux::LsmState>,
    trackers: HashMap<String, ContainerPolicyTracker>,
}

impl PathPolicyManager {
    /// Probe, load, attach, and pin. Degrades to unavailable on any failure
    /// after undoing intermediate state.
    pub fn new() -> Self {
        #[cfg(target_os = "linux")]
        {
            if !lsm_bpf_enabled() {
                info!("bpf lsm not stacked by this kernel, path policy enforcement disabled");
                return Self::unavailable();
            }
            let object = std::env::var(OBJECT_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OBJECT));
            match linux::LsmState::init(&object, Path::new(PIN_DIR), Path::new(PIN_PATH)) {
                Ok(state) => {
                    info!(pin = PIN_PATH, "bpf lsm policy map attached");
                    Self {
                        state: Some(state),
                        trackers: HashMap::new(),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "bpf lsm setup failed, path policy enforcement disabled");
                    Self::unavailable()
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = lsm_bpf_enabled();
            Self::unavailable()
        }
    }

    /// A manager with enforcement disabled; every operation is a no-op.
    pub fn unavailable() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            state: None,
            trackers: HashMap::new(),
        }
    }

    pub fn available(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.state.is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    /// Number of entries currently tracked for `container_id`.
    pub fn tracked_entries(&self, container_id: &str) -> usize {
        self.trackers
            .get(container_id)
            .map(ContainerPolicyTracker::len)
            .unwrap_or(0)
    }

    /// Resolve the container's cgroup identity and insert one allow-map
    /// entry per stat-able allow path. Entries that cannot be resolved are
    /// skipped silently; the tracker cap drops (and warns about) overflow
    /// entries without failing the call. Returns the number inserted.
    pub fn populate(
        &mut self,
        container_id: &str,
        root_path: &Path,
        policy: &Policy,
    ) -> Result<usize> {
        if !self.available() {
            return Ok(0);
        }
        validate_container_id(container_id)?;

        #[cfg(target_os = "linux")]
        {
            let cgroup_id = linux::cgroup_inode(container_id)?;
            let tracker = self
                .trackers
                .entry(container_id.to_string())
                .or_insert_with(|| ContainerPolicyTracker::new(container_id));
            let state = self.state.as_mut().expect("available implies state");

            let mut inserted = 0;
            for (path, access) in policy.allow_paths() {
                let effective = policy.effective_access(path, *access);
                if effective.is_empty() {
                    continue;
                }
                let Some(full) = join_container_path(root_path, path) else {
                    debug!(path, "allow path exceeds the platform path limit, skipping");
                    continue;
                };
                let (dev, ino) = match linux::stat_dev_ino(&full) {
                    Some(pair) => pair,
                    None => {
                        debug!(path = %full.display(), "allow path not present, skipping");
                        continue;
                    }
                };
                let key = PolicyMapKey {
                    cgroup_id,
                    dev,
                    ino,
                };
                if !tracker.track(key) {
                    continue;
                }
                state.insert(
                    key,
                    PolicyMapValue {
                        allow_mask: effective.bits(),
                    },
                )?;
                inserted += 1;
            }
            debug!(
                container = container_id,
                inserted, "populated allow-map entries"
            );
            Ok(inserted)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (root_path, policy);
            Ok(0)
        }
    }

    /// Remove every entry tracked for `container_id`. A container that never
    /// had policy entries succeeds with no side effect.
    pub fn cleanup(&mut self, container_id: &str) -> Result<()> {
        let Some(tracker) = self.trackers.remove(container_id) else {
            return Ok(());
        };
        #[cfg(target_os = "linux")]
        if let Some(state) = self.state.as_mut() {
            state.delete_keys(tracker.keys())?;
            debug!(
                container = container_id,
                entries = tracker.len(),
                "removed allow-map entries"
            );
        }
        #[cfg(not(target_os = "linux"))]
        let _ = tracker;
        Ok(())
    }

    /// Unpin, detach, and release the map; drops all trackers.
    pub fn shutdown(&mut self) {
        self.trackers.clear();
        #[cfg(target_os = "linux")]
        if let Some(state) = self.state.take() {
            state.release();
        }
    }
}

impl Default for PathPolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PathPolicyManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Concatenate a container-relative path onto the composed root, refusing
/// results past the platform limit.
fn join_container_path(root: &Path, path: &str) -> Option<PathBuf> {
    let relative = path.trim_start_matches('/');
    let full = root.join(relative);
    let max = 4096; // PATH_MAX on every platform cvd runs on
    if full.as_os_str().len() >= max {
        return None;
    }
    Some(full)
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::RawFd;
    use std::path::{Path, PathBuf};

    use aya::maps::{HashMap as AllowMap, MapData};
    use aya::programs::Lsm;
    use aya::{Bpf, Btf};
    use chef_common::{Error, Result};
    use tracing::debug;

    use crate::{PolicyMapKey, PolicyMapValue};

    const MAP_NAME: &str = "CVD_ALLOW_MAP";
    const PROGRAM_NAME: &str = "file_open";

    pub(super) struct LsmState {
        // Keeps the program and its attachment alive.
        _bpf: Bpf,
        map: AllowMap<MapData, PolicyMapKey, PolicyMapValue>,
        pin_path: PathBuf,
    }

    impl LsmState {
        pub(super) fn init(object: &Path, pin_dir: &Path, pin_path: &Path) -> Result<Self> {
            raise_memlock_limit()?;
            std::fs::create_dir_all(pin_dir)?;

            let mut bpf = Bpf::load_file(object).map_err(|e| {
                Error::Unavailable(format!("loading {} failed: {e}", object.display()))
            })?;

            let btf = Btf::from_sys_fs()
                .map_err(|e| Error::Unavailable(format!("kernel btf unavailable: {e}")))?;
            let program: &mut Lsm = bpf
                .program_mut(PROGRAM_NAME)
                .ok_or_else(|| {
                    Error::Unavailable(format!("object lacks the {PROGRAM_NAME} program"))
                })?
                .try_into()
                .map_err(|e| Error::internal(format!("{PROGRAM_NAME} is not an lsm hook: {e}")))?;
            program
                .load(PROGRAM_NAME, &btf)
                .map_err(|e| Error::Unavailable(format!("lsm program load failed: {e}")))?;
            program
                .attach()
                .map_err(|e| Error::Unavailable(format!("lsm attach failed: {e}")))?;

            let mut map = bpf
                .take_map(MAP_NAME)
                .ok_or_else(|| Error::Unavailable(format!("object lacks the {MAP_NAME} map")))?;
            // Replace a stale pin from a previous run before pinning anew.
            let _ = std::fs::remove_file(pin_path);
            map.pin(pin_path)
                .map_err(|e| Error::internal(format!("pinning allow map failed: {e}")))?;
            let map = AllowMap::try_from(map)
                .map_err(|e| Error::internal(format!("allow map has the wrong shape: {e}")))?;

            Ok(Self {
                _bpf: bpf,
                map,
                pin_path: pin_path.to_path_buf(),
            })
        }

        pub(super) fn insert(&mut self, key: PolicyMapKey, value: PolicyMapValue) -> Result<()> {
            self.map
                .insert(key, value, 0)
                .map_err(|e| Error::internal(format!("allow map insert failed: {e}")))
        }

        /// Batched removal with a per-key fallback for kernels without
        /// `BPF_MAP_DELETE_BATCH`.
        pub(super) fn delete_keys(&mut self, keys: &[PolicyMapKey]) -> Result<()> {
            if keys.is_empty() {
                return Ok(());
            }
            match batch_delete(&self.pin_path, keys) {
                Ok(()) => return Ok(()),
                Err(Error::Unavailable(reason)) => {
                    debug!(reason, "batch delete unsupported, deleting individually");
                }
                Err(e) => return Err(e),
            }
            for key in keys {
                // A key may already be gone; only real failures surface.
                if let Err(e) = self.map.remove(key) {
                    let benign = matches!(
                        &e,
                        aya::maps::MapError::SyscallError(sys)
                            if sys.io_error.raw_os_error() == Some(libc::ENOENT)
                    );
                    if !benign {
                        return Err(Error::internal(format!("allow map delete failed: {e}")));
                    }
                }
            }
            Ok(())
        }

        pub(super) fn release(self) {
            let _ = std::fs::remove_file(&self.pin_path);
            // Dropping `_bpf` detaches the program and frees the map.
        }
    }

    fn raise_memlock_limit() -> Result<()> {
        let limit = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(Error::from_errno(errno, "setrlimit(RLIMIT_MEMLOCK)"));
        }
        Ok(())
    }

    /// Inode of the container's cgroup directory, the container's identity
    /// in the allow-map.
    pub(super) fn cgroup_inode(container_id: &str) -> Result<u64> {
        let path = PathBuf::from("/sys/fs/cgroup").join(container_id);
        match nix::sys::stat::stat(&path) {
            Ok(stat) => Ok(stat.st_ino),
            Err(errno) => Err(Error::from_errno(
                errno as i32,
                &format!("stat {}", path.display()),
            )),
        }
    }

    pub(super) fn stat_dev_ino(path: &Path) -> Option<(u64, u64)> {
        nix::sys::stat::stat(path)
            .ok()
            .map(|stat| (stat.st_dev, stat.st_ino))
    }

    // bpf(2) plumbing for batched map operations. Only the fields of
    // `union bpf_attr` the two commands consume are modeled.

    const BPF_OBJ_GET: libc::c_int = 7;
    const BPF_MAP_DELETE_BATCH: libc::c_int = 27;

    #[repr(C, align(8))]
    #[derive(Default)]
    struct BpfObjGetAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }

    #[repr(C, align(8))]
    #[derive(Default)]
    struct BpfMapBatchAttr {
        in_batch: u64,
        out_batch: u64,
        keys: u64,
        values: u64,
        count: u32,
        map_fd: u32,
        elem_flags: u64,
        flags: u64,
    }

    unsafe fn bpf_syscall<T>(cmd: libc::c_int, attr: &mut T) -> std::io::Result<libc::c_long> {
        let ret = libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        );
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ret)
    }

    fn batch_delete(pin_path: &Path, keys: &[PolicyMapKey]) -> Result<()> {
        let pathname = std::ffi::CString::new(pin_path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::invalid_argument("pin path contains a nul byte"))?;
        let mut get = BpfObjGetAttr {
            pathname: pathname.as_ptr() as u64,
            ..Default::default()
        };
        let fd = unsafe { bpf_syscall(BPF_OBJ_GET, &mut get) }.map_err(|e| {
            Error::internal(format!("opening pinned map {} failed: {e}", pin_path.display()))
        })? as RawFd;

        let mut attr = BpfMapBatchAttr {
            keys: keys.as_ptr() as u64,
            count: keys.len() as u32,
            map_fd: fd as u32,
            ..Default::default()
        };
        let result = unsafe { bpf_syscall(BPF_MAP_DELETE_BATCH, &mut attr) };
        unsafe {
            libc::close(fd);
        }
        match result {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                // Older kernels reject the command outright.
                Some(libc::EINVAL) | Some(libc::ENOTSUP) => Err(Error::Unavailable(
                    "kernel lacks BPF_MAP_DELETE_BATCH".to_string(),
                )),
                // Partial progress with missing keys is fine on teardown.
                Some(libc::ENOENT) => Ok(()),
                Some(errno) => Err(Error::from_errno(errno, "bpf map batch delete")),
                None => Err(Error::internal(format!("bpf map batch delete failed: {e}"))),
            },
        }
    }
}
