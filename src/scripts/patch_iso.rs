// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines a script that suppresses the boot prompt in an existing
//! installer ISO, for media that didn't pass through the ESD pipeline.

use std::collections::HashMap;

use anyhow::Result;
use camino::Utf8PathBuf;
use colored::Colorize;

use crate::isopatch;
use crate::runner::{Context, Script, ScriptStep, Ui};

#[derive(Clone)]
pub struct PatchIsoArgs {
    pub iso: Utf8PathBuf,
}

pub struct PatchIsoScript {
    steps: Vec<ScriptStep>,
    args: PatchIsoArgs,
}

impl PatchIsoScript {
    pub fn new(args: PatchIsoArgs) -> Self {
        Self { steps: get_script(), args }
    }
}

impl Script for PatchIsoScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(
        &self,
        mut w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()> {
        writeln!(w, "Suppressing the boot prompt in an installer ISO:\n")?;
        writeln!(w, "  {}: {}", "ISO".bold(), self.args.iso)?;

        Ok(())
    }

    fn file_prerequisites(&self) -> Vec<Utf8PathBuf> {
        vec![self.args.iso.clone()]
    }

    fn initial_context(&self) -> HashMap<String, String> {
        [("iso".to_string(), self.args.iso.to_string())]
            .into_iter()
            .collect()
    }
}

fn suppress_boot_prompt(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let iso = Utf8PathBuf::from(ctx.get_var("iso").unwrap());
    isopatch::suppress_boot_prompt(&iso, ui)
}

fn get_script() -> Vec<ScriptStep> {
    // Rebuilding needs 7z and genisoimage, but the in-place fallback needs
    // neither, so nothing here is a hard prerequisite.
    vec![ScriptStep::new(
        "replace the prompting boot binary",
        suppress_boot_prompt,
    )]
}
