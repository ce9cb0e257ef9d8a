//! Request dispatch for the container daemon. Owned entirely by the single
//! event-loop thread; no locking.

use std::path::{Path, PathBuf};

use chef_common::settings::{PolicyPreset, SecuritySettings};
use chef_container::{
    Capabilities, Container, ContainerConfig, ContainerError, ContainerRegistry, SpawnOptions,
    TransferDirection,
};
use chef_lsm::PathPolicyManager;
use chef_policy::{Policy, PolicyKind};
use tracing::{info, warn};

use crate::protocol::{
    unflatten_environment, CreateParams, CvdRequest, CvdResponse, DestroyParams, FileParams,
    KillParams, SpawnParams, SPAWN_WAIT,
};

pub struct CvdService {
    registry: ContainerRegistry,
    lsm: PathPolicyManager,
    security: SecuritySettings,
    work_root: PathBuf,
}

impl CvdService {
    pub fn new(security: SecuritySettings, work_root: PathBuf, lsm: PathPolicyManager) -> Self {
        Self {
            registry: ContainerRegistry::new(),
            lsm,
            security,
            work_root,
        }
    }

    pub fn handle(&mut self, request: CvdRequest) -> CvdResponse {
        match request {
            CvdRequest::Create(params) => self.create(params),
            CvdRequest::Spawn(params) => self.spawn(params),
            CvdRequest::Upload(params) => self.transfer(params, TransferDirection::Upload),
            CvdRequest::Download(params) => self.transfer(params, TransferDirection::Download),
            CvdRequest::Kill(params) => self.kill(params),
            CvdRequest::Destroy(params) => self.destroy(params),
        }
    }

    fn create(&mut self, params: CreateParams) -> CvdResponse {
        let policy = match self.resolve_policy(&params.policy.profiles) {
            Ok(policy) => policy,
            Err(response) => return response,
        };
        let config = ContainerConfig {
            id: params.id,
            layers: params.layers,
            policy,
            caps: Capabilities::FILESYSTEM | Capabilities::PROCESS_CONTROL,
        };
        match Container::create(config, &self.work_root, &mut self.lsm) {
            Ok(container) => {
                let id = container.id().to_string();
                if let Err(e) = self.registry.insert(container) {
                    return error_response(e);
                }
                CvdResponse::Created { id }
            }
            Err(e) => error_response(e),
        }
    }

    /// Per-container profiles override the daemon default entirely; the
    /// daemon's custom paths apply only when the default policy is used.
    fn resolve_policy(&self, profiles_csv: &str) -> Result<Policy, CvdResponse> {
        let csv = profiles_csv.trim();
        if csv.is_empty() {
            let kind = match self.security.default_policy {
                PolicyPreset::Minimal => PolicyKind::Minimal,
                PolicyPreset::Build => PolicyKind::Build,
                PolicyPreset::Network => PolicyKind::Network,
            };
            let mut policy = Policy::new(kind);
            for custom in &self.security.custom_paths {
                if let Err(e) = policy.add_path(custom.path.clone(), custom.access) {
                    return Err(error_response_from_common(e));
                }
            }
            return Ok(policy);
        }

        let mut merged: Option<Policy> = None;
        for token in csv.split(',') {
            let kind = match token.trim() {
                "minimal" => PolicyKind::Minimal,
                "build" => PolicyKind::Build,
                "network" => PolicyKind::Network,
                "custom" => PolicyKind::Custom,
                other => {
                    return Err(CvdResponse::Error {
                        kind: "invalid-argument".to_string(),
                        message: format!("unknown policy profile {other:?}"),
                    })
                }
            };
            let preset = Policy::new(kind);
            match merged.as_mut() {
                None => merged = Some(preset),
                Some(policy) => {
                    if let Err(e) = policy.merge(&preset) {
                        return Err(error_response_from_common(e));
                    }
                }
            }
        }
        Ok(merged.unwrap_or_else(|| Policy::new(PolicyKind::Custom)))
    }

    fn spawn(&mut self, params: SpawnParams) -> CvdResponse {
        let env =
            match unflatten_environment(&params.environment, params.environment_count) {
                Ok(env) => env,
                Err(e) => return error_response_from_common(e),
            };
        let wait = params.options & SPAWN_WAIT != 0;
        let container = match self.registry.get_mut(&params.container_id) {
            Ok(container) => container,
            Err(e) => return error_response(e),
        };
        match container.spawn(&params.command, &env, SpawnOptions { wait }) {
            Ok(outcome) => CvdResponse::Spawned {
                pid: outcome.pid,
                exit: outcome.exit,
            },
            Err(e) => error_response(e),
        }
    }

    fn transfer(&mut self, params: FileParams, direction: TransferDirection) -> CvdResponse {
        let container = match self.registry.get_mut(&params.container_id) {
            Ok(container) => container,
            Err(e) => return error_response(e),
        };
        match container.transfer(
            Path::new(&params.source_path),
            Path::new(&params.destination_path),
            direction,
        ) {
            Ok(()) => CvdResponse::Ok,
            Err(e) => error_response(e),
        }
    }

    fn kill(&mut self, params: KillParams) -> CvdResponse {
        let container = match self.registry.get_mut(&params.container_id) {
            Ok(container) => container,
            Err(e) => return error_response(e),
        };
        match container.kill(params.pid, params.signal) {
            Ok(()) => CvdResponse::Ok,
            Err(e) => error_response(e),
        }
    }

    /// Registry removal comes first; cleanup continues past failures.
    fn destroy(&mut self, params: DestroyParams) -> CvdResponse {
        let mut container = match self.registry.remove(&params.container_id) {
            Ok(container) => container,
            Err(e) => return error_response(e),
        };
        match container.destroy(&mut self.lsm) {
            Ok(()) => CvdResponse::Ok,
            Err(e) => error_response(e),
        }
    }

    /// Destroy every live container and release the kernel state.
    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.registry.ids().map(str::to_string).collect();
        for id in ids {
            if let Ok(mut container) = self.registry.remove(&id) {
                if let Err(e) = container.destroy(&mut self.lsm) {
                    warn!(container = %id, error = %e, "teardown failed during shutdown");
                }
            }
        }
        self.lsm.shutdown();
        info!("container service stopped");
    }

    pub fn live_containers(&self) -> usize {
        self.registry.len()
    }
}

fn error_response(err: ContainerError) -> CvdResponse {
    let kind = match &err {
        ContainerError::InvalidContainerId(_) => "invalid-container-id",
        ContainerError::InvalidMounts(_) => "invalid-mounts",
        ContainerError::FailedRootfsSetup(_) => "failed-rootfs-setup",
        ContainerError::Internal(_) => "internal-error",
    };
    CvdResponse::Error {
        kind: kind.to_string(),
        message: err.to_string(),
    }
}

fn error_response_from_common(err: chef_common::Error) -> CvdResponse {
    let kind = match &err {
        chef_common::Error::InvalidArgument(_) => "invalid-argument",
        chef_common::Error::Capacity(_) => "capacity",
        chef_common::Error::NotFound(_) => "invalid-container-id",
        _ => "internal-error",
    };
    CvdResponse::Error {
        kind: kind.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chef_common::settings::CustomPath;
    use chef_common::AccessMask;
    use tempfile::tempdir;

    fn service_with(security: SecuritySettings) -> (CvdService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let service = CvdService::new(
            security,
            dir.path().to_path_buf(),
            PathPolicyManager::unavailable(),
        );
        (service, dir)
    }

    fn security_with_custom_paths() -> SecuritySettings {
        SecuritySettings {
            default_policy: PolicyPreset::Minimal,
            custom_paths: vec![CustomPath {
                path: "/opt/extra".to_string(),
                access: AccessMask::READ,
            }],
        }
    }

    #[test]
    fn default_policy_includes_daemon_custom_paths() {
        let (service, _dir) = service_with(security_with_custom_paths());
        let policy = service.resolve_policy("").unwrap();
        assert!(policy
            .allow_paths()
            .iter()
            .any(|(path, _)| path == "/opt/extra"));
    }

    #[test]
    fn per_container_profiles_disable_custom_paths() {
        let (service, _dir) = service_with(security_with_custom_paths());
        let policy = service.resolve_policy("minimal").unwrap();
        assert!(
            !policy
                .allow_paths()
                .iter()
                .any(|(path, _)| path == "/opt/extra"),
            "profile CSV must override the daemon default entirely"
        );
    }

    #[test]
    fn profile_csv_merges_presets() {
        let (service, _dir) = service_with(SecuritySettings::default());
        let policy = service.resolve_policy("minimal,network").unwrap();
        assert!(policy.syscalls().iter().any(|rule| rule.name == "socket"));
        assert!(policy.syscalls().iter().any(|rule| rule.name == "read"));
        assert!(!policy.syscalls().iter().any(|rule| rule.name == "mount"));
    }

    #[test]
    fn unknown_profile_token_is_rejected() {
        let (service, _dir) = service_with(SecuritySettings::default());
        match service.resolve_policy("minimal,bogus") {
            Err(CvdResponse::Error { kind, .. }) => assert_eq!(kind, "invalid-argument"),
            other => panic!("expected an error response, got {other:?}"),
        }
    }

    #[test]
    fn operations_on_unknown_containers_report_invalid_id() {
        let (mut service, _dir) = service_with(SecuritySettings::default());
        let response = service.handle(CvdRequest::Spawn(SpawnParams {
            container_id: "missing".to_string(),
            command: "/bin/true".to_string(),
            environment: String::new(),
            environment_count: 0,
            options: SPAWN_WAIT,
        }));
        match response {
            CvdResponse::Error { kind, .. } => assert_eq!(kind, "invalid-container-id"),
            other => panic!("unexpected response: {other:?}"),
        }

        let response = service.handle(CvdRequest::Destroy(DestroyParams {
            container_id: "missing".to_string(),
        }));
        match response {
            CvdResponse::Error { kind, .. } => assert_eq!(kind, "invalid-container-id"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn bad_environment_count_is_invalid_argument() {
        let (mut service, _dir) = service_with(SecuritySettings::default());
        let response = service.handle(CvdRequest::Spawn(SpawnParams {
            container_id: "any".to_string(),
            command: "/bin/true".to_string(),
            environment: "A=1\0".to_string(),
            environment_count: 3,
            options: 0,
        }));
        match response {
            CvdResponse::Error { kind, .. } => assert_eq!(kind, "invalid-argument"),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
