// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines a script for turning a Windows distribution ESD into a bootable
//! installer ISO carrying a single edition.

use std::collections::HashMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use colored::Colorize;

use crate::isopatch;
use crate::runner::{Context, Script, ScriptStep, Ui};
use crate::wim;

/// The directory inside the VM directory where the ESD's setup media is
/// staged before being repacked into an ISO.
const SCRATCH_DIR_NAME: &str = "iso-extract";

#[derive(Clone)]
pub struct BuildInstallerArgs {
    pub vm_dir: Utf8PathBuf,
    pub esd: Utf8PathBuf,
    pub edition: String,
}

pub struct BuildInstallerScript {
    steps: Vec<ScriptStep>,
    args: BuildInstallerArgs,
}

impl BuildInstallerScript {
    pub fn new(args: BuildInstallerArgs) -> Self {
        Self { steps: get_script(), args }
    }
}

impl Script for BuildInstallerScript {
    fn steps(&self) -> &[ScriptStep] {
        self.steps.as_slice()
    }

    fn print_configuration(
        &self,
        mut w: Box<dyn std::io::Write>,
    ) -> std::io::Result<()> {
        writeln!(w, "Building a Windows installer ISO with these options:\n")?;

        let args = &self.args;
        writeln!(w, "  {}: {}", "VM directory".bold(), args.vm_dir)?;
        writeln!(w, "  {}: {}", "Source ESD".bold(), args.esd)?;
        writeln!(w, "  {}: {}", "Edition".bold(), args.edition)?;
        writeln!(w)?;
        writeln!(
            w,
            "  {}: {}",
            "Output file".bold(),
            args.vm_dir.join("installer.iso")
        )?;

        Ok(())
    }

    fn file_prerequisites(&self) -> Vec<Utf8PathBuf> {
        vec![self.args.esd.clone()]
    }

    fn initial_context(&self) -> HashMap<String, String> {
        let args = &self.args;
        [
            ("vm_dir".to_string(), args.vm_dir.to_string()),
            ("esd".to_string(), args.esd.to_string()),
            ("edition".to_string(), args.edition.to_string()),
        ]
        .into_iter()
        .collect()
    }
}

fn scratch_dir(ctx: &Context) -> Utf8PathBuf {
    Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap()).join(SCRATCH_DIR_NAME)
}

fn resolve_edition(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let esd = Utf8PathBuf::from(ctx.get_var("esd").unwrap());
    let requested = ctx.get_var("edition").unwrap().to_owned();

    let catalog = wim::EditionCatalog::read(&esd, ui)?;
    let choice = catalog.resolve(&requested)?;
    if choice.fallback {
        log::warn!(
            "edition \"{requested}\" is not in this archive; installing \
             \"{}\" instead",
            choice.name
        );
    }

    ui.set_substep(format!("extracting \"{}\"", choice.name));
    ctx.set_var("edition_index", choice.index.to_string());
    ctx.set_var("edition_name", choice.name);
    Ok(())
}

fn extract_setup_media(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let scratch = scratch_dir(ctx);
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)?;
    }
    std::fs::create_dir_all(&scratch)?;

    let esd = Utf8PathBuf::from(ctx.get_var("esd").unwrap());
    wim::apply_setup_media(&esd, &scratch, ui)
}

fn export_boot_volumes(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let esd = Utf8PathBuf::from(ctx.get_var("esd").unwrap());
    let boot_wim = scratch_dir(ctx).join("sources/boot.wim");
    wim::export_boot_volumes(&esd, &boot_wim, ui)
}

fn export_install_volume(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let esd = Utf8PathBuf::from(ctx.get_var("esd").unwrap());
    let index: u32 = ctx.get_var("edition_index").unwrap().parse()?;
    let install_wim = scratch_dir(ctx).join("sources/install.wim");
    wim::export_install_volume(&esd, index, &install_wim, ui)
}

/// Swaps the prompting EFI boot binary for the silent one so the ISO boots
/// unattended.
fn use_noprompt_boot_binary(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let scratch = scratch_dir(ctx);
    let noprompt = scratch.join(isopatch::EFISYS_NOPROMPT);
    let efisys = scratch.join(isopatch::EFISYS);

    if !noprompt.exists() {
        return Err(isopatch::PatchError::NopromptBinaryMissing.into());
    }

    ui.set_substep(format!("copying {noprompt} over {efisys}"));
    std::fs::copy(&noprompt, &efisys)?;
    Ok(())
}

fn build_iso(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let output =
        Utf8PathBuf::from(ctx.get_var("vm_dir").unwrap()).join("installer.iso");
    isopatch::build_iso_from_tree(&scratch_dir(ctx), &output, ui)
}

/// Removes the staging tree and the source ESD. The ESD only goes once the
/// ISO is safely built, so an interrupted run can start over.
fn clean_up(ctx: &mut Context, ui: &Ui) -> Result<()> {
    let scratch = scratch_dir(ctx);
    ui.set_substep(format!("removing {scratch}"));
    std::fs::remove_dir_all(&scratch)?;

    let esd = Utf8Path::new(ctx.get_var("esd").unwrap());
    ui.set_substep(format!("removing {esd}"));
    std::fs::remove_file(esd)?;
    Ok(())
}

fn get_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::with_prereqs(
            "resolve the Windows edition to extract",
            resolve_edition,
            &["wiminfo"],
        ),
        ScriptStep::with_prereqs(
            "extract setup media from the ESD",
            extract_setup_media,
            &["wimapply"],
        ),
        ScriptStep::with_prereqs(
            "export WinPE and Setup into boot.wim",
            export_boot_volumes,
            &["wimexport"],
        ),
        ScriptStep::with_prereqs(
            "export the edition into install.wim",
            export_install_volume,
            &["wimexport"],
        ),
        ScriptStep::new(
            "switch to the no-prompt EFI boot binary",
            use_noprompt_boot_binary,
        ),
        ScriptStep::with_prereqs(
            "pack the installer ISO",
            build_iso,
            &["genisoimage"],
        ),
        ScriptStep::new("clean up staging files", clean_up),
    ]
}
