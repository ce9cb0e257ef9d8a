//! Installs a policy's syscall allow-set for the current process.
//!
//! Runs in the sandboxed child between fork and exec, single-threaded. Any
//! failure here must abort the child before exec: a partially-applied
//! filter never goes live because `load` is the only effectful step.

use chef_common::Result;

use crate::Policy;

/// Environment switch that turns the filter into audit mode: violations are
/// logged instead of failing with EPERM.
pub const AUDIT_ENV: &str = "CHEF_SECCOMP_AUDIT";

/// Build and irrevocably load the syscall filter for the current process.
#[cfg(target_os = "linux")]
pub fn apply_syscall_filter(policy: &Policy) -> Result<()> {
    use chef_common::Error;
    use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};
    use tracing::debug;

    let audit = std::env::var_os(AUDIT_ENV).is_some();
    let default_action = if audit {
        ScmpAction::Log
    } else {
        ScmpAction::Errno(libc::EPERM)
    };

    let mut ctx = ScmpFilterContext::new_filter(default_action)
        .map_err(|e| Error::internal(format!("seccomp init failed: {e}")))?;

    for rule in policy.syscalls() {
        let syscall = match ScmpSyscall::from_name(&rule.name) {
            Ok(syscall) => syscall,
            Err(_) => {
                // Architecture mismatch; the name has no number here.
                debug!(syscall = %rule.name, "skipping unresolvable syscall");
                continue;
            }
        };

        if rule.args.is_empty() {
            ctx.add_rule(ScmpAction::Allow, syscall)
                .map_err(|e| Error::internal(format!("seccomp rule {}: {e}", rule.name)))?;
            continue;
        }

        let comparators = comparators_for(rule)?;
        ctx.add_rule_conditional(ScmpAction::Allow, syscall, &comparators)
            .map_err(|e| Error::internal(format!("seccomp rule {}: {e}", rule.name)))?;
    }

    // Must precede load: an unprivileged process may not install a filter
    // that privileged children could escape.
    prctl::set_no_new_privileges(true)
        .map_err(|code| Error::internal(format!("failed to set no_new_privileges: {code}")))?;

    ctx.load()
        .map_err(|e| Error::internal(format!("seccomp load failed: {e}")))?;
    Ok(())
}

/// Translate one rule's predicates into libseccomp comparators.
#[cfg(target_os = "linux")]
fn comparators_for(
    rule: &crate::SyscallRule,
) -> Result<Vec<libseccomp::ScmpArgCompare>> {
    use chef_common::Error;
    use libseccomp::{ScmpArgCompare, ScmpCompareOp};

    use crate::{ArgOp, MAX_ARG_PREDICATES};

    if rule.args.len() > MAX_ARG_PREDICATES {
        return Err(Error::invalid_argument(format!(
            "syscall {} carries {} predicates, limit is {MAX_ARG_PREDICATES}",
            rule.name,
            rule.args.len()
        )));
    }
    let mut comparators = Vec::with_capacity(rule.args.len());
    for predicate in &rule.args {
        let index = predicate.index as u32;
        let comparator = if predicate.value < 0 {
            // Negative values are sign-extended by the kernel; compare only
            // the low 32 bits.
            if predicate.op != ArgOp::Eq {
                return Err(Error::invalid_argument(format!(
                    "syscall {}: negative argument outside an equality predicate",
                    rule.name
                )));
            }
            ScmpArgCompare::new(
                index,
                ScmpCompareOp::MaskedEqual(0xFFFF_FFFF),
                predicate.value as u64 & 0xFFFF_FFFF,
            )
        } else {
            let op = match predicate.op {
                ArgOp::Eq => ScmpCompareOp::Equal,
                ArgOp::Ne => ScmpCompareOp::NotEqual,
                ArgOp::Lt => ScmpCompareOp::Less,
                ArgOp::Le => ScmpCompareOp::LessOrEqual,
                ArgOp::Gt => ScmpCompareOp::Greater,
                ArgOp::Ge => ScmpCompareOp::GreaterEqual,
                ArgOp::MaskedEq(mask) => ScmpCompareOp::MaskedEqual(mask),
            };
            ScmpArgCompare::new(index, op, predicate.value as u64)
        };
        comparators.push(comparator);
    }
    Ok(comparators)
}

#[cfg(not(target_os = "linux"))]
pub fn apply_syscall_filter(_policy: &Policy) -> Result<()> {
    Err(chef_common::Error::Unavailable(
        "seccomp filtering requires Linux".to_string(),
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::{ArgOp, ArgPredicate, SyscallRule};
    use chef_common::Error;

    // Loading a live filter would sandbox the test runner, so coverage stops
    // at comparator construction; `apply_syscall_filter` itself is exercised
    // in the sandboxed child.

    fn rule_with(args: Vec<ArgPredicate>) -> SyscallRule {
        SyscallRule {
            name: "ioctl".to_string(),
            args,
        }
    }

    #[test]
    fn positive_predicates_translate() {
        let rule = rule_with(vec![
            ArgPredicate {
                index: 1,
                op: ArgOp::Eq,
                value: 0x5401,
            },
            ArgPredicate {
                index: 2,
                op: ArgOp::MaskedEq(0xff),
                value: 0x42,
            },
        ]);
        assert_eq!(comparators_for(&rule).unwrap().len(), 2);
    }

    #[test]
    fn negative_value_requires_eq() {
        let rule = rule_with(vec![ArgPredicate {
            index: 0,
            op: ArgOp::Lt,
            value: -1,
        }]);
        assert!(matches!(
            comparators_for(&rule),
            Err(Error::InvalidArgument(_))
        ));

        let rule = rule_with(vec![ArgPredicate {
            index: 0,
            op: ArgOp::Eq,
            value: -1,
        }]);
        assert_eq!(comparators_for(&rule).unwrap().len(), 1);
    }

    #[test]
    fn predicate_count_cap() {
        let rule = rule_with(
            (0..6)
                .map(|i| ArgPredicate {
                    index: i,
                    op: ArgOp::Eq,
                    value: 0,
                })
                .collect(),
        );
        assert!(matches!(
            comparators_for(&rule),
            Err(Error::InvalidArgument(_))
        ));
    }
}
