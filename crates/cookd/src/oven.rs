//! Step execution inside the build container.

use std::path::Path;

use chef_common::{Error, Result};
use chef_container::{Container, SpawnOptions};
use tracing::{debug, info};

use crate::recipe::{Part, Step, StepKind};

/// In-container directory the sources are mounted at.
pub const PROJECT_DIR: &str = "/chef/project";
/// In-container install root that gets packed.
pub const INSTALL_DIR: &str = "/chef/install";
/// In-container roots for resolved ingredients.
pub const INGREDIENT_DIR: &str = "/chef/ingredients";
pub const TOOLCHAIN_DIR: &str = "/chef/toolchains";

/// Run one recipe step to completion. Returns an error for a nonzero exit,
/// which stops the part pipeline.
pub fn bake_step(
    container: &mut Container,
    build_id: &str,
    sources_host: &Path,
    part: &Part,
    index: usize,
    step: &Step,
) -> Result<()> {
    let command = step_command(step, part, index, sources_host)?;
    let env = step_environment(step);

    info!(
        build = build_id,
        part = %part.name,
        step = index,
        command = %command,
        "baking step"
    );
    let outcome = container
        .spawn(&command, &env, SpawnOptions { wait: true })
        .map_err(chef_common::Error::from)?;

    match outcome.exit {
        Some(0) => {
            debug!(build = build_id, part = %part.name, step = index, "step finished");
            Ok(())
        }
        Some(code) => Err(Error::internal(format!(
            "part {} step {index} exited with {code}",
            part.name
        ))),
        None => Err(Error::internal(format!(
            "part {} step {index} did not report an exit code",
            part.name
        ))),
    }
}

/// The command line for a step. Script steps are written into the mounted
/// sources so arbitrary shell survives the program/arguments split.
fn step_command(step: &Step, part: &Part, index: usize, sources_host: &Path) -> Result<String> {
    match step.kind {
        StepKind::Generate | StepKind::Build => {
            let system = step.system.as_deref().ok_or_else(|| {
                Error::invalid_argument(format!(
                    "part {} step {index} has no build system",
                    part.name
                ))
            })?;
            let mut command = String::from(system);
            for option in &step.options {
                command.push(' ');
                command.push_str(option);
            }
            for argument in &step.arguments {
                command.push(' ');
                command.push_str(argument);
            }
            Ok(command)
        }
        StepKind::Script => {
            let script = step.script.as_deref().ok_or_else(|| {
                Error::invalid_argument(format!(
                    "part {} step {index} is a script step without a script",
                    part.name
                ))
            })?;
            let file = format!(".chef-step-{}-{index}.sh", part.name);
            let host_path = sources_host.join(&file);
            std::fs::write(&host_path, format!("#!/bin/bash\nset -e\n{script}\n"))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755))?;
            }
            Ok(format!("/bin/bash {PROJECT_DIR}/{file}"))
        }
    }
}

fn step_environment(step: &Step) -> Vec<String> {
    let mut env = vec![
        "PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        format!("CHEF_PROJECT_DIR={PROJECT_DIR}"),
        format!("CHEF_INSTALL_DIR={INSTALL_DIR}"),
        format!("CHEF_TOOLCHAIN_DIR={TOOLCHAIN_DIR}"),
    ];
    for (key, value) in &step.env {
        env.push(format!("{key}={value}"));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn part() -> Part {
        Part {
            name: "core".to_string(),
            toolchain: None,
            source: None,
            steps: Vec::new(),
        }
    }

    fn step(kind: StepKind) -> Step {
        Step {
            kind,
            name: None,
            system: None,
            options: Vec::new(),
            arguments: Vec::new(),
            env: BTreeMap::new(),
            script: None,
        }
    }

    #[test]
    fn generate_steps_join_system_options_arguments() {
        let dir = tempdir().unwrap();
        let mut generate = step(StepKind::Generate);
        generate.system = Some("cmake".to_string());
        generate.options = vec!["-G".to_string(), "Ninja".to_string()];
        generate.arguments = vec!["-B".to_string(), "build".to_string()];
        let command = step_command(&generate, &part(), 0, dir.path()).unwrap();
        assert_eq!(command, "cmake -G Ninja -B build");
    }

    #[test]
    fn build_step_without_system_is_invalid() {
        let dir = tempdir().unwrap();
        let build = step(StepKind::Build);
        assert!(matches!(
            step_command(&build, &part(), 1, dir.path()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn script_steps_materialize_under_the_sources() {
        let dir = tempdir().unwrap();
        let mut script = step(StepKind::Script);
        script.script = Some("make -C docs html".to_string());
        let command = step_command(&script, &part(), 2, dir.path()).unwrap();
        assert_eq!(command, format!("/bin/bash {PROJECT_DIR}/.chef-step-core-2.sh"));

        let written = std::fs::read_to_string(dir.path().join(".chef-step-core-2.sh")).unwrap();
        assert!(written.starts_with("#!/bin/bash\nset -e\n"));
        assert!(written.contains("make -C docs html"));
    }

    #[test]
    fn step_env_layers_defaults_under_the_recipe() {
        let mut with_env = step(StepKind::Build);
        with_env
            .env
            .insert("CC".to_string(), "clang".to_string());
        let env = step_environment(&with_env);
        assert!(env.iter().any(|e| e.starts_with("PATH=")));
        assert!(env.contains(&"CC=clang".to_string()));
    }
}
