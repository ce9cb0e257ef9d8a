//! Daemon configuration loaded from JSON files in the platform config
//! directory. A missing file yields the platform defaults; a malformed file
//! is an initialization failure.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::access::AccessMask;
use crate::error::{Error, Result};

/// Where a daemon exposes its API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApiAddress {
    /// Unix socket path. A leading `@` denotes a Linux abstract socket.
    Local { address: String },
    Inet4 { address: String, port: u16 },
}

impl ApiAddress {
    pub fn is_abstract(&self) -> bool {
        matches!(self, ApiAddress::Local { address } if address.starts_with('@'))
    }
}

impl fmt::Display for ApiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAddress::Local { address } => write!(f, "local:{address}"),
            ApiAddress::Inet4 { address, port } => write!(f, "inet4:{address}:{port}"),
        }
    }
}

fn default_cook_address() -> ApiAddress {
    if cfg!(windows) {
        ApiAddress::Inet4 {
            address: "127.0.0.1".to_string(),
            port: 51002,
        }
    } else {
        ApiAddress::Local {
            address: "/run/chef/waiterd/cook".to_string(),
        }
    }
}

fn default_cvd_address() -> ApiAddress {
    if cfg!(windows) {
        ApiAddress::Inet4 {
            address: "127.0.0.1".to_string(),
            port: 51003,
        }
    } else {
        ApiAddress::Local {
            address: "@/chef/cvd/api".to_string(),
        }
    }
}

fn default_builders() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// `cookd.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookdSettings {
    #[serde(rename = "api-address", default = "default_cook_address")]
    pub api_address: ApiAddress,
    /// Number of concurrent builder threads.
    #[serde(default = "default_builders")]
    pub builders: usize,
    /// Root of the per-build scratch trees.
    #[serde(rename = "build-root", default = "default_build_root")]
    pub build_root: PathBuf,
    /// Base rootfs composed under every build container.
    #[serde(default = "default_rootfs")]
    pub rootfs: PathBuf,
    /// Local fridge store for resolved ingredients.
    #[serde(default = "default_fridge_root")]
    pub fridge: PathBuf,
    /// Where uploaded artifacts land.
    #[serde(default = "default_artifact_root")]
    pub artifacts: PathBuf,
}

fn default_build_root() -> PathBuf {
    PathBuf::from("/var/chef/builds")
}

fn default_rootfs() -> PathBuf {
    PathBuf::from("/var/chef/rootfs/base")
}

fn default_fridge_root() -> PathBuf {
    PathBuf::from("/var/chef/fridge")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("/var/chef/artifacts")
}

impl Default for CookdSettings {
    fn default() -> Self {
        Self {
            api_address: default_cook_address(),
            builders: default_builders(),
            build_root: default_build_root(),
            rootfs: default_rootfs(),
            fridge: default_fridge_root(),
            artifacts: default_artifact_root(),
        }
    }
}

/// Named policy preset selectable from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    Minimal,
    Build,
    Network,
}

impl Default for PolicyPreset {
    fn default() -> Self {
        PolicyPreset::Minimal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPath {
    pub path: String,
    pub access: AccessMask,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub default_policy: PolicyPreset,
    #[serde(default)]
    pub custom_paths: Vec<CustomPath>,
}

/// `cvd.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdSettings {
    #[serde(rename = "api-address", default = "default_cvd_address")]
    pub api_address: ApiAddress,
    #[serde(default)]
    pub security: SecuritySettings,
    /// Host directory under which container roots are composed.
    #[serde(rename = "work-root", default = "default_work_root")]
    pub work_root: PathBuf,
}

fn default_work_root() -> PathBuf {
    PathBuf::from("/var/chef/containers")
}

impl Default for CvdSettings {
    fn default() -> Self {
        Self {
            api_address: default_cvd_address(),
            security: SecuritySettings::default(),
            work_root: default_work_root(),
        }
    }
}

/// Resolve the platform config directory, honoring `CHEF_CONFIG_DIR`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHEF_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if cfg!(windows) {
        PathBuf::from("C:\\ProgramData\\chef")
    } else {
        PathBuf::from("/etc/chef")
    }
}

fn load_json<T>(path: &Path) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed = serde_json::from_str(&raw).map_err(|e| {
        Error::invalid_argument(format!("malformed config {}: {e}", path.display()))
    })?;
    Ok(Some(parsed))
}

impl CookdSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir())
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        Ok(load_json(&dir.join("cookd.json"))?.unwrap_or_default())
    }
}

impl CvdSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir())
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        Ok(load_json(&dir.join("cvd.json"))?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let cook = CookdSettings::load_from(dir.path()).unwrap();
        let cvd = CvdSettings::load_from(dir.path()).unwrap();
        #[cfg(not(windows))]
        {
            assert_eq!(
                cook.api_address,
                ApiAddress::Local {
                    address: "/run/chef/waiterd/cook".to_string()
                }
            );
            assert!(cvd.api_address.is_abstract());
        }
        assert_eq!(cvd.security.default_policy, PolicyPreset::Minimal);
        assert!(cvd.security.custom_paths.is_empty());
    }

    #[test]
    fn parses_inet4_address() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("cookd.json"),
            r#"{ "api-address": { "type": "inet4", "address": "0.0.0.0", "port": 9001 }, "builders": 3 }"#,
        )
        .unwrap();
        let cook = CookdSettings::load_from(dir.path()).unwrap();
        assert_eq!(
            cook.api_address,
            ApiAddress::Inet4 {
                address: "0.0.0.0".to_string(),
                port: 9001
            }
        );
        assert_eq!(cook.builders, 3);
    }

    #[test]
    fn parses_security_section() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("cvd.json"),
            r#"{
                "api-address": { "type": "local", "address": "/tmp/cvd.sock" },
                "security": {
                    "default_policy": "build",
                    "custom_paths": [
                        { "path": "/opt/toolchains/**", "access": "read,execute" }
                    ]
                }
            }"#,
        )
        .unwrap();
        let cvd = CvdSettings::load_from(dir.path()).unwrap();
        assert_eq!(cvd.security.default_policy, PolicyPreset::Build);
        assert_eq!(cvd.security.custom_paths.len(), 1);
        assert_eq!(
            cvd.security.custom_paths[0].access,
            AccessMask::READ | AccessMask::EXEC
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("cvd.json"), "{ not json").unwrap();
        assert!(CvdSettings::load_from(dir.path()).is_err());
    }
}
