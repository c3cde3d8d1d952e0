// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions shared by multiple scripts.

use std::process::{Command, Output};

use camino::Utf8PathBuf;

use crate::runner::{ScriptStep, Ui};

/// Runs a `Command` and returns its output, displaying the command on the
/// current step's progress line. Returns `Err` if the command's exit status
/// indicates that it failed.
pub fn run_command_check_status(
    cmd: &mut Command,
    ui: &Ui,
) -> anyhow::Result<Output> {
    ui.set_substep(format!("executing: {:?}", cmd));
    run_command_check_status_logged(cmd)
}

/// Runs a `Command` and returns its output, logging the command instead of
/// driving a progress line. Used by teardown paths (`Drop` impls and cleanup
/// routines) that run outside of any script step.
pub fn run_command_check_status_logged(
    cmd: &mut Command,
) -> anyhow::Result<Output> {
    log::debug!("executing: {:?}", cmd);
    let output = cmd.output()?;
    if !output.status.success() {
        anyhow::bail!(
            "'{}' returned non-success exit code: {:?}",
            cmd.get_program().to_string_lossy(),
            output
        );
    }

    Ok(output)
}

/// Checks that every external command named by the supplied steps resolves on
/// the current PATH, returning a list of human-readable complaints for the
/// ones that don't.
pub fn check_executable_prerequisites(steps: &[ScriptStep]) -> Vec<String> {
    let mut missing = Vec::new();
    for step in steps {
        for cmd in step.prereq_commands() {
            if which::which(cmd).is_err() {
                let complaint =
                    format!("command '{}' not found on this system", cmd);
                if !missing.contains(&complaint) {
                    missing.push(complaint);
                }
            }
        }
    }

    missing
}

/// Checks that every path in `files` exists, returning complaints for the
/// ones that don't.
pub fn check_file_prerequisites(files: &[Utf8PathBuf]) -> Vec<String> {
    let mut missing = Vec::new();
    for file in files {
        if !file.exists() {
            missing.push(format!("required file '{}' not found", file));
        }
    }

    missing
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::Context;

    fn nop(_: &mut Context, _: &Ui) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn missing_files_are_reported() {
        let complaints = check_file_prerequisites(&[Utf8PathBuf::from(
            "/nonexistent/surely/not/here.iso",
        )]);
        assert_eq!(complaints.len(), 1);
        assert!(complaints[0].contains("here.iso"));
    }

    #[test]
    fn duplicate_missing_commands_reported_once() {
        let steps = vec![
            ScriptStep::with_prereqs("a", nop, &["no-such-tool-xyz"]),
            ScriptStep::with_prereqs("b", nop, &["no-such-tool-xyz"]),
        ];

        let complaints = check_executable_prerequisites(&steps);
        assert_eq!(complaints.len(), 1);
    }
}
