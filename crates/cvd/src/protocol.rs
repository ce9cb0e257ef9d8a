//! Wire messages of the container daemon api.

use chef_common::{Error, Result};
use chef_container::Layer;
use serde::{Deserialize, Serialize};

/// Spawn option bit: block until the process exits.
pub const SPAWN_WAIT: u32 = 0x1;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum CvdRequest {
    Create(CreateParams),
    Spawn(SpawnParams),
    Upload(FileParams),
    Download(FileParams),
    Kill(KillParams),
    Destroy(DestroyParams),
}

#[derive(Debug, Deserialize)]
pub struct CreateParams {
    #[serde(default)]
    pub id: Option<String>,
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub policy: PolicyParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyParams {
    /// CSV of `minimal`, `build`, `network`, `custom`. Empty means the
    /// daemon default policy.
    #[serde(default)]
    pub profiles: String,
}

#[derive(Debug, Deserialize)]
pub struct SpawnParams {
    pub container_id: String,
    pub command: String,
    /// NUL-separated `KEY=VALUE` entries.
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub environment_count: u32,
    #[serde(default)]
    pub options: u32,
}

#[derive(Debug, Deserialize)]
pub struct FileParams {
    pub container_id: String,
    pub source_path: String,
    pub destination_path: String,
}

#[derive(Debug, Deserialize)]
pub struct KillParams {
    pub container_id: String,
    pub pid: i32,
    pub signal: i32,
}

#[derive(Debug, Deserialize)]
pub struct DestroyParams {
    pub container_id: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum CvdResponse {
    Ok,
    Created { id: String },
    Spawned { pid: i32, exit: Option<i32> },
    Error { kind: String, message: String },
}

/// Rebuild the environment list from its flattened wire form.
pub fn unflatten_environment(flat: &str, count: u32) -> Result<Vec<String>> {
    let entries: Vec<String> = flat
        .split('\0')
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    if entries.len() != count as usize {
        return Err(Error::invalid_argument(format!(
            "environment count {count} does not match {} entries",
            entries.len()
        )));
    }
    Ok(entries)
}
