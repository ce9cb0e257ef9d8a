//! Wire events the cook daemon reports back to its orchestrator.

use serde::{Deserialize, Serialize};

/// Progress of one build as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Unknown,
    Queued,
    Sourcing,
    Building,
    Packing,
    Done,
    Failed,
}

impl BuildStatus {
    /// Terminal statuses end the build's event stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Done | BuildStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Log,
    Package,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: String,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&BuildStatus::Sourcing).unwrap();
        assert_eq!(json, "\"sourcing\"");
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        for status in [
            BuildStatus::Unknown,
            BuildStatus::Queued,
            BuildStatus::Sourcing,
            BuildStatus::Building,
            BuildStatus::Packing,
        ] {
            assert!(!status.is_terminal());
        }
        assert!(BuildStatus::Done.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }

    #[test]
    fn artifact_event_uses_type_key() {
        let event = ArtifactEvent {
            id: "b-1".to_string(),
            kind: ArtifactKind::Log,
            uri: "chef://artifacts/b-1/build.log".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
    }
}
