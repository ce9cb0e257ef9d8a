//! The policy value type: preset plus caller additions, consumed at
//! container creation.

use chef_common::{AccessMask, Error, Result};
use serde::{Deserialize, Serialize};
use chef_pathmatch::{
    compile, CompileConfig, CompileFlags, CompiledPathProfile, MatchEngine, PathPattern,
};

use crate::presets;

pub const MAX_ALLOW_PATHS: usize = 256;
pub const MAX_SYSCALLS: usize = 256;
pub const MAX_ARG_PREDICATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Minimal,
    Build,
    Network,
    Custom,
}

/// Argument comparison operators for syscall rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    MaskedEq(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgPredicate {
    /// Argument index, 0..=5.
    pub index: u8,
    pub op: ArgOp,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallRule {
    pub name: String,
    pub args: Vec<ArgPredicate>,
}

impl SyscallRule {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub max_deny_paths: usize,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self { max_deny_paths: 64 }
    }
}

/// A named policy built from a preset plus caller additions. Value type:
/// cloned into the syscall filter and the kernel allow-map at container
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    kind: PolicyKind,
    syscalls: Vec<SyscallRule>,
    allow_paths: Vec<(String, AccessMask)>,
    deny_paths: Vec<(String, AccessMask)>,
    limits: PolicyLimits,
}

impl Policy {
    pub fn new(kind: PolicyKind) -> Self {
        Self::with_limits(kind, PolicyLimits::default())
    }

    pub fn with_limits(kind: PolicyKind, limits: PolicyLimits) -> Self {
        let mut policy = Self {
            kind,
            syscalls: Vec::new(),
            allow_paths: Vec::new(),
            deny_paths: Vec::new(),
            limits,
        };
        match kind {
            PolicyKind::Custom => {}
            PolicyKind::Minimal => policy.apply_preset(&[presets::MINIMAL_SYSCALLS]),
            PolicyKind::Build => {
                policy.apply_preset(&[presets::MINIMAL_SYSCALLS, presets::BUILD_SYSCALLS])
            }
            PolicyKind::Network => {
                policy.apply_preset(&[presets::MINIMAL_SYSCALLS, presets::NETWORK_SYSCALLS])
            }
        }
        policy
    }

    fn apply_preset(&mut self, groups: &[&[&str]]) {
        for group in groups {
            for name in *group {
                self.syscalls.push(SyscallRule::plain(*name));
            }
        }
        self.allow_paths = presets::minimal_allow_paths();
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn syscalls(&self) -> &[SyscallRule] {
        &self.syscalls
    }

    pub fn allow_paths(&self) -> &[(String, AccessMask)] {
        &self.allow_paths
    }

    pub fn deny_paths(&self) -> &[(String, AccessMask)] {
        &self.deny_paths
    }

    /// Add plain syscall rules by name. Fails without mutating when the
    /// result would exceed the syscall cap.
    pub fn add_syscalls<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let new: Vec<SyscallRule> = names
            .into_iter()
            .map(|name| SyscallRule::plain(name.into()))
            .filter(|rule| !self.syscalls.iter().any(|have| have.name == rule.name))
            .collect();
        if self.syscalls.len() + new.len() > MAX_SYSCALLS {
            return Err(Error::Capacity(format!(
                "syscall rules would exceed {MAX_SYSCALLS}"
            )));
        }
        self.syscalls.extend(new);
        Ok(())
    }

    /// Add one syscall rule with argument predicates.
    pub fn add_syscall_rule(&mut self, rule: SyscallRule) -> Result<()> {
        if rule.args.len() > MAX_ARG_PREDICATES {
            return Err(Error::invalid_argument(format!(
                "syscall {} carries {} predicates, limit is {MAX_ARG_PREDICATES}",
                rule.name,
                rule.args.len()
            )));
        }
        for predicate in &rule.args {
            if predicate.index > 5 {
                return Err(Error::invalid_argument(format!(
                    "syscall {}: argument index {} out of range",
                    rule.name, predicate.index
                )));
            }
            if predicate.value < 0 && predicate.op != ArgOp::Eq {
                return Err(Error::invalid_argument(format!(
                    "syscall {}: negative argument values require an equality predicate",
                    rule.name
                )));
            }
        }
        if self.syscalls.len() + 1 > MAX_SYSCALLS {
            return Err(Error::Capacity(format!(
                "syscall rules would exceed {MAX_SYSCALLS}"
            )));
        }
        self.syscalls.push(rule);
        Ok(())
    }

    pub fn add_path(&mut self, path: impl Into<String>, access: AccessMask) -> Result<()> {
        if self.allow_paths.len() + 1 > MAX_ALLOW_PATHS {
            return Err(Error::Capacity(format!(
                "allow paths would exceed {MAX_ALLOW_PATHS}"
            )));
        }
        self.allow_paths.push((path.into(), access));
        Ok(())
    }

    pub fn add_paths<I, S>(&mut self, paths: I, access: AccessMask) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let new: Vec<(String, AccessMask)> = paths
            .into_iter()
            .map(|path| (path.into(), access))
            .collect();
        if self.allow_paths.len() + new.len() > MAX_ALLOW_PATHS {
            return Err(Error::Capacity(format!(
                "allow paths would exceed {MAX_ALLOW_PATHS}"
            )));
        }
        self.allow_paths.extend(new);
        Ok(())
    }

    /// Fold another policy's rules into this one, respecting the caps.
    /// Used when a container requests several profiles at once.
    pub fn merge(&mut self, other: &Policy) -> Result<()> {
        let new_syscalls: Vec<SyscallRule> = other
            .syscalls
            .iter()
            .filter(|rule| !self.syscalls.iter().any(|have| have.name == rule.name))
            .cloned()
            .collect();
        let new_paths: Vec<(String, AccessMask)> = other
            .allow_paths
            .iter()
            .filter(|(path, access)| {
                !self
                    .allow_paths
                    .iter()
                    .any(|(have, mask)| have == path && mask.contains(*access))
            })
            .cloned()
            .collect();
        if self.syscalls.len() + new_syscalls.len() > MAX_SYSCALLS {
            return Err(Error::Capacity(format!(
                "merged syscall rules would exceed {MAX_SYSCALLS}"
            )));
        }
        if self.allow_paths.len() + new_paths.len() > MAX_ALLOW_PATHS {
            return Err(Error::Capacity(format!(
                "merged allow paths would exceed {MAX_ALLOW_PATHS}"
            )));
        }
        self.syscalls.extend(new_syscalls);
        self.allow_paths.extend(new_paths);
        for (path, deny) in &other.deny_paths {
            if !self.deny_paths.iter().any(|(have, _)| have == path) {
                self.deny_path(path.clone(), *deny)?;
            }
        }
        Ok(())
    }

    pub fn deny_path(&mut self, path: impl Into<String>, deny: AccessMask) -> Result<()> {
        if self.deny_paths.len() + 1 > self.limits.max_deny_paths {
            return Err(Error::Capacity(format!(
                "deny paths would exceed {}",
                self.limits.max_deny_paths
            )));
        }
        self.deny_paths.push((path.into(), deny));
        Ok(())
    }

    /// Compile the path rules into matchable profiles for enforcement.
    pub fn compile_profile(&self) -> Result<PolicyProfile> {
        let cfg = CompileConfig {
            // Literal entries expand to two patterns each.
            max_patterns: 2 * MAX_ALLOW_PATHS,
            ..CompileConfig::default()
        };
        let mut allow_patterns = Vec::new();
        for (path, access) in &self.allow_paths {
            push_path_patterns(&mut allow_patterns, path, *access);
        }
        let allow = compile(
            &allow_patterns,
            CompileFlags::default(),
            &cfg,
            MatchEngine::Dfa,
        )?;
        let deny = if self.deny_paths.is_empty() {
            None
        } else {
            let mut deny_patterns = Vec::new();
            for (path, deny) in &self.deny_paths {
                push_path_patterns(&mut deny_patterns, path, *deny);
            }
            Some(compile(
                &deny_patterns,
                CompileFlags::default(),
                &cfg,
                MatchEngine::Dfa,
            )?)
        };
        Ok(PolicyProfile { allow, deny })
    }

    /// Effective access for a literal path entry, with deny bits removed.
    /// Used when projecting the policy into the kernel allow-map.
    pub fn effective_access(&self, path: &str, granted: AccessMask) -> AccessMask {
        let denied = self
            .deny_paths
            .iter()
            .filter(|(deny_path, _)| path == deny_path || path.starts_with(&format!("{deny_path}/")))
            .fold(AccessMask::NONE, |acc, (_, mask)| acc | *mask);
        AccessMask::from_bits_truncate(granted.bits() & !denied.bits())
    }
}

/// A path without metacharacters also covers everything beneath it, so a
/// literal entry expands to the exact path plus a `/**` subtree glob.
fn push_path_patterns(out: &mut Vec<PathPattern>, path: &str, mask: AccessMask) {
    let has_meta = path.bytes().any(|b| matches!(b, b'*' | b'?' | b'['));
    if has_meta {
        out.push(PathPattern::new(path, mask));
        return;
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        out.push(PathPattern::new("/**", mask));
        return;
    }
    out.push(PathPattern::new(trimmed, mask));
    out.push(PathPattern::new(format!("{trimmed}/**"), mask));
}

/// Compiled path rules: allow grants, deny strips.
pub struct PolicyProfile {
    allow: CompiledPathProfile,
    deny: Option<CompiledPathProfile>,
}

impl PolicyProfile {
    /// The access the policy grants for `path` after deny rules.
    pub fn granted(&self, path: &str) -> AccessMask {
        let allowed = self.allow.matches(path, AccessMask::NONE);
        if !allowed.matched {
            return AccessMask::NONE;
        }
        let mut granted = allowed.granted;
        if let Some(deny) = &self.deny {
            let denied = deny.matches(path, AccessMask::NONE).granted;
            granted = AccessMask::from_bits_truncate(granted.bits() & !denied.bits());
        }
        granted
    }

    /// True when `path` is allowed with all of `required`.
    pub fn check(&self, path: &str, required: AccessMask) -> bool {
        self.granted(path).contains(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_preset_shape() {
        let policy = Policy::new(PolicyKind::Minimal);
        assert!(policy.syscalls().len() >= 50);
        assert!(policy
            .syscalls()
            .iter()
            .any(|rule| rule.name == "epoll_wait"));
        assert!(!policy.syscalls().iter().any(|rule| rule.name == "socket"));
        assert!(!policy.syscalls().iter().any(|rule| rule.name == "mount"));
        assert!(policy
            .allow_paths()
            .iter()
            .any(|(path, access)| path == "/dev/urandom"
                && *access == (AccessMask::READ | AccessMask::EXEC)));
    }

    #[test]
    fn build_preset_extends_minimal() {
        let policy = Policy::new(PolicyKind::Build);
        for name in ["execve", "mount", "setxattr", "capset", "fsync"] {
            assert!(
                policy.syscalls().iter().any(|rule| rule.name == name),
                "build preset missing {name}"
            );
        }
        assert!(!policy.syscalls().iter().any(|rule| rule.name == "socket"));
    }

    #[test]
    fn network_preset_has_sockets_but_no_mounts() {
        let policy = Policy::new(PolicyKind::Network);
        assert!(policy.syscalls().iter().any(|rule| rule.name == "socket"));
        assert!(!policy.syscalls().iter().any(|rule| rule.name == "mount"));
    }

    #[test]
    fn custom_preset_starts_empty() {
        let policy = Policy::new(PolicyKind::Custom);
        assert!(policy.syscalls().is_empty());
        assert!(policy.allow_paths().is_empty());
    }

    #[test]
    fn allow_path_cap_fails_without_mutating() {
        let mut policy = Policy::new(PolicyKind::Custom);
        for i in 0..MAX_ALLOW_PATHS {
            policy.add_path(format!("/p/{i}"), AccessMask::READ).unwrap();
        }
        let before = policy.allow_paths().len();
        let err = policy.add_path("/p/overflow", AccessMask::READ).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert_eq!(policy.allow_paths().len(), before);
    }

    #[test]
    fn bulk_add_over_cap_is_atomic() {
        let mut policy = Policy::new(PolicyKind::Custom);
        let paths: Vec<String> = (0..MAX_ALLOW_PATHS + 1).map(|i| format!("/p/{i}")).collect();
        let err = policy.add_paths(paths, AccessMask::READ).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(policy.allow_paths().is_empty());
    }

    #[test]
    fn syscall_duplicates_do_not_count_against_cap() {
        let mut policy = Policy::new(PolicyKind::Minimal);
        let before = policy.syscalls().len();
        policy.add_syscalls(["read", "write"]).unwrap();
        assert_eq!(policy.syscalls().len(), before);
    }

    #[test]
    fn negative_arg_requires_eq() {
        let mut policy = Policy::new(PolicyKind::Custom);
        let bad = SyscallRule {
            name: "fcntl".to_string(),
            args: vec![ArgPredicate {
                index: 0,
                op: ArgOp::Lt,
                value: -1,
            }],
        };
        assert!(matches!(
            policy.add_syscall_rule(bad),
            Err(Error::InvalidArgument(_))
        ));
        let ok = SyscallRule {
            name: "fcntl".to_string(),
            args: vec![ArgPredicate {
                index: 0,
                op: ArgOp::Eq,
                value: -1,
            }],
        };
        policy.add_syscall_rule(ok).unwrap();
    }

    #[test]
    fn too_many_predicates_rejected() {
        let mut policy = Policy::new(PolicyKind::Custom);
        let rule = SyscallRule {
            name: "ioctl".to_string(),
            args: (0..6)
                .map(|i| ArgPredicate {
                    index: i,
                    op: ArgOp::Eq,
                    value: 0,
                })
                .collect(),
        };
        assert!(matches!(
            policy.add_syscall_rule(rule),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn profile_grants_under_literal_prefixes() {
        let mut policy = Policy::new(PolicyKind::Custom);
        policy
            .add_path("/usr/lib", AccessMask::READ | AccessMask::EXEC)
            .unwrap();
        let profile = policy.compile_profile().unwrap();
        assert!(profile.check("/usr/lib/libc.so.6", AccessMask::READ));
        assert!(profile.check("/usr/lib/glib/loaders.cache", AccessMask::EXEC));
        assert!(!profile.check("/usr/libexec/helper", AccessMask::READ));
    }

    #[test]
    fn deny_strips_granted_bits() {
        let mut policy = Policy::new(PolicyKind::Custom);
        policy.add_path("/work", AccessMask::ALL).unwrap();
        policy.deny_path("/work/secrets", AccessMask::WRITE).unwrap();
        let profile = policy.compile_profile().unwrap();
        assert!(profile.check("/work/build.ninja", AccessMask::WRITE));
        assert!(!profile.check("/work/secrets/key.pem", AccessMask::WRITE));
        assert!(profile.check("/work/secrets/key.pem", AccessMask::READ));

        assert_eq!(
            policy.effective_access("/work/secrets/key.pem", AccessMask::ALL),
            AccessMask::READ | AccessMask::EXEC
        );
    }

    #[test]
    fn deny_ceiling_is_configurable() {
        let mut policy =
            Policy::with_limits(PolicyKind::Custom, PolicyLimits { max_deny_paths: 1 });
        policy.deny_path("/a", AccessMask::WRITE).unwrap();
        assert!(matches!(
            policy.deny_path("/b", AccessMask::WRITE),
            Err(Error::Capacity(_))
        ));
    }
}
