//! The declarative build description loaded from the sources tree.
//!
//! The recipe format itself is owned by the orchestrator tooling; this is
//! the read-only serde view the executor consumes.

use std::collections::BTreeMap;
use std::path::Path;

use chef_common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    #[serde(default)]
    pub toolchain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub host: HostEnvironment,
    #[serde(default)]
    pub build: ScopedEnvironment,
    #[serde(default)]
    pub runtime: ScopedEnvironment,
    #[serde(default)]
    pub hooks: Hooks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEnvironment {
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedEnvironment {
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub bash: Option<String>,
    #[serde(default)]
    pub powershell: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeIngredient {
    pub name: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_channel() -> String {
    "stable".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(default)]
    pub toolchain: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Generate,
    Build,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub name: Option<String>,
    /// Build system driving this step, e.g. `cmake` or `make`.
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub script: Option<String>,
}

impl Recipe {
    /// Read and parse `<sources>/<recipe_path>`.
    pub fn load(path: &Path) -> Result<(Self, Vec<u8>)> {
        let bytes = std::fs::read(path)?;
        let recipe = serde_json::from_slice(&bytes).map_err(|e| {
            Error::invalid_argument(format!("malformed recipe {}: {e}", path.display()))
        })?;
        Ok((recipe, bytes))
    }

    /// Toolchain for a part: the part's own, else the platform's.
    pub fn toolchain_for<'a>(&'a self, part: &'a Part, platform: &str) -> Option<&'a str> {
        if let Some(toolchain) = part.toolchain.as_deref() {
            return Some(toolchain);
        }
        self.platforms
            .iter()
            .find(|candidate| candidate.name == platform)
            .and_then(|candidate| candidate.toolchain.as_deref())
    }

    /// True when the recipe declares support for `platform`; an empty
    /// platform list means unrestricted.
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|candidate| candidate.name == platform)
    }
}
