//! In-kernel filesystem policy enforcement via the BPF LSM.
//!
//! The container daemon owns one process-wide pinned hash map keyed by
//! `(cgroup_id, dev, ino)`; the attached `file_open` LSM program consults it
//! to authorize opens. This crate loads and attaches the program, populates
//! the map per container, and tears entries down per container.

mod manager;
mod tracker;

pub use manager::{PathPolicyManager, PIN_DIR, PIN_PATH};
pub use tracker::{ContainerPolicyTracker, MAX_TRACKED_ENTRIES};

/// Allow-map key, bit-exact with the BPF program's definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct PolicyMapKey {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
}

/// Allow-map value: permission bits `READ=0x1 WRITE=0x2 EXEC=0x4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolicyMapValue {
    pub allow_mask: u32,
}

#[cfg(target_os = "linux")]
unsafe impl aya::Pod for PolicyMapKey {}
#[cfg(target_os = "linux")]
unsafe impl aya::Pod for PolicyMapValue {}

/// True when the running kernel stacks the `bpf` LSM.
pub fn lsm_bpf_enabled() -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/sys/kernel/security/lsm") {
            Ok(raw) => raw.trim().split(',').any(|token| token == "bpf"),
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
