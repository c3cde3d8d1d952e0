// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and exporting volumes from Windows ESD/WIM archives using the
//! wimlib tools.
//!
//! A distribution ESD carries the setup media root as volume 1, WinPE as
//! volume 2, Windows Setup as volume 3, and one volume per Windows edition
//! after that.

use std::process::Command;

use camino::Utf8Path;
use itertools::Itertools;
use thiserror::Error;

use crate::runner::Ui;
use crate::util::run_command_check_status;

/// Editions to try, in order, when the requested one isn't in the archive.
/// Only swaps between closely-related editions so the installed system stays
/// recognizable as what the user asked for.
const EDITION_FALLBACKS: &[(&str, &[&str])] = &[
    ("Pro", &["Pro N", "Pro Education", "Pro for Workstations"]),
    ("Pro N", &["Pro", "Pro Education N", "Pro N for Workstations"]),
    ("Home", &["Home N"]),
    ("Home N", &["Home"]),
    ("Education", &["Education N", "Pro Education"]),
    ("Education N", &["Education", "Pro Education N"]),
    ("Enterprise", &["Enterprise N"]),
    ("Enterprise N", &["Enterprise"]),
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(
        "edition \"{requested}\" not found in the archive (available: \
         {available})"
    )]
    EditionNotFound { requested: String, available: String },
}

/// The index and full name of the edition volume chosen for extraction, and
/// whether it came from the fallback chain rather than an exact match.
#[derive(Debug, PartialEq)]
pub struct EditionChoice {
    pub index: u32,
    pub name: String,
    pub fallback: bool,
}

/// The volumes in a WIM/ESD archive, as reported by `wiminfo`.
pub struct EditionCatalog {
    entries: Vec<(u32, String)>,
}

impl EditionCatalog {
    /// Reads the catalog of the archive at `path`.
    pub fn read(path: &Utf8Path, ui: &Ui) -> anyhow::Result<Self> {
        let output = run_command_check_status(
            Command::new("wiminfo").arg(path.as_str()),
            ui,
        )?;

        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Parses `wiminfo` output. Each volume is described by a block of
    /// `Key:   Value` lines; only `Index` and `Name` matter here.
    pub fn parse(wiminfo_output: &str) -> Self {
        let mut entries = Vec::new();
        let mut index = None;
        for line in wiminfo_output.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("Index:") {
                index = value.trim().parse::<u32>().ok();
            } else if let Some(value) = line.strip_prefix("Name:") {
                if let Some(index) = index.take() {
                    entries.push((index, value.trim().to_owned()));
                }
            }
        }

        Self { entries }
    }

    /// Picks the volume to extract for the requested edition, walking the
    /// fallback chain when the exact edition is missing. `requested` is the
    /// short edition name ("Pro", "Home N"); volume names are full product
    /// names ("Windows 11 Pro").
    pub fn resolve(
        &self,
        requested: &str,
    ) -> Result<EditionChoice, ExtractError> {
        if let Some((index, name)) = self.lookup(requested) {
            return Ok(EditionChoice { index, name, fallback: false });
        }

        // The chain is keyed by short edition names, but callers may hand in
        // a full product name ("Windows 11 Pro N").
        let substitutes = EDITION_FALLBACKS
            .iter()
            .find(|(edition, _)| {
                *edition == requested
                    || requested.ends_with(&format!(" {edition}"))
            })
            .map(|(_, subs)| *subs)
            .unwrap_or(&[]);

        for substitute in substitutes {
            if let Some((index, name)) = self.lookup(substitute) {
                return Ok(EditionChoice { index, name, fallback: true });
            }
        }

        Err(ExtractError::EditionNotFound {
            requested: requested.to_owned(),
            available: self
                .entries
                .iter()
                .map(|(_, name)| format!("\"{name}\""))
                .join(", "),
        })
    }

    fn lookup(&self, edition: &str) -> Option<(u32, String)> {
        let suffix = format!(" {edition}");
        self.entries
            .iter()
            .find(|(_, name)| name == edition || name.ends_with(&suffix))
            .map(|(index, name)| (*index, name.clone()))
    }
}

/// Applies the setup-media volume (volume 1) of `archive` into `dest`,
/// producing the file tree of an installation disk.
pub fn apply_setup_media(
    archive: &Utf8Path,
    dest: &Utf8Path,
    ui: &Ui,
) -> anyhow::Result<()> {
    run_command_check_status(
        Command::new("wimapply").args([
            archive.as_str(),
            "1",
            dest.as_str(),
        ]),
        ui,
    )
    .map(|_| ())
}

/// Exports the WinPE and Windows Setup volumes into a `boot.wim`. Setup
/// (volume 3) is marked bootable; LZX keeps the boot image small enough for
/// the installer's loader.
pub fn export_boot_volumes(
    archive: &Utf8Path,
    boot_wim: &Utf8Path,
    ui: &Ui,
) -> anyhow::Result<()> {
    run_command_check_status(
        Command::new("wimexport").args([
            archive.as_str(),
            "2",
            boot_wim.as_str(),
            "--compress=LZX",
            "--chunk-size=32K",
        ]),
        ui,
    )?;

    run_command_check_status(
        Command::new("wimexport").args([
            archive.as_str(),
            "3",
            boot_wim.as_str(),
            "--compress=LZX",
            "--chunk-size=32K",
            "--boot",
        ]),
        ui,
    )
    .map(|_| ())
}

/// Exports the edition volume at `index` into an uncompressed `install.wim`.
/// Setup reads the image many times during installation; skipping
/// recompression trades disk space for a much faster install.
pub fn export_install_volume(
    archive: &Utf8Path,
    index: u32,
    install_wim: &Utf8Path,
    ui: &Ui,
) -> anyhow::Result<()> {
    run_command_check_status(
        Command::new("wimexport").args([
            archive.as_str(),
            &index.to_string(),
            install_wim.as_str(),
            "--compress=none",
        ]),
        ui,
    )
    .map(|_| ())
}

/// Reads the full name of the first (usually only) edition in an installed
/// media's `install.wim`/`install.esd`, for product key selection.
pub fn first_edition_name(wiminfo_output: &str) -> Option<String> {
    EditionCatalog::parse(wiminfo_output)
        .entries
        .first()
        .map(|(_, name)| name.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    const WIMINFO_OUTPUT: &str = r#"
WIM Information:
----------------
Path:           /tmp/win11.esd
GUID:           0x8a1c...
Image Count:    6

Available Images:
-----------------
Index:                  1
Name:                   Windows 11 Setup Media
Description:            Windows 11 Setup Media

Index:                  2
Name:                   Microsoft Windows PE (arm64)

Index:                  3
Name:                   Microsoft Windows Setup (arm64)

Index:                  4
Name:                   Windows 11 Home
Display Name:           Windows 11 Home

Index:                  5
Name:                   Windows 11 Home N

Index:                  6
Name:                   Windows 11 Pro N
"#;

    #[test]
    fn parses_wiminfo_output() {
        let catalog = EditionCatalog::parse(WIMINFO_OUTPUT);
        assert_eq!(catalog.entries.len(), 6);
        assert_eq!(
            catalog.entries[3],
            (4, "Windows 11 Home".to_owned())
        );
    }

    #[test]
    fn resolves_exact_edition() {
        let catalog = EditionCatalog::parse(WIMINFO_OUTPUT);
        let choice = catalog.resolve("Home").unwrap();
        assert_eq!(
            choice,
            EditionChoice {
                index: 4,
                name: "Windows 11 Home".to_owned(),
                fallback: false
            }
        );
    }

    #[test]
    fn short_name_does_not_match_longer_edition() {
        // "Pro" must not match "Windows 11 Pro N".
        let catalog = EditionCatalog::parse(WIMINFO_OUTPUT);
        let choice = catalog.resolve("Pro").unwrap();
        assert!(choice.fallback);
        assert_eq!(choice.name, "Windows 11 Pro N");
    }

    #[test]
    fn falls_back_to_related_edition() {
        let catalog = EditionCatalog::parse(
            "Index:  4\nName:  Windows 11 Home N\n",
        );
        let choice = catalog.resolve("Home").unwrap();
        assert_eq!(
            choice,
            EditionChoice {
                index: 4,
                name: "Windows 11 Home N".to_owned(),
                fallback: true
            }
        );
    }

    #[test]
    fn full_product_name_requests_use_the_fallback_chain() {
        let catalog = EditionCatalog::parse(
            "Index:  3\nName:  Windows Pro\nIndex:  4\nName:  Windows Home\n",
        );
        let choice = catalog.resolve("Windows Pro N").unwrap();
        assert_eq!(
            choice,
            EditionChoice {
                index: 3,
                name: "Windows Pro".to_owned(),
                fallback: true
            }
        );
    }

    #[test]
    fn unknown_edition_lists_available() {
        let catalog = EditionCatalog::parse(WIMINFO_OUTPUT);
        let err = catalog.resolve("Enterprise").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Enterprise"));
        assert!(msg.contains("Windows 11 Home"));
        assert!(msg.contains("Windows 11 Pro N"));
    }

    #[test]
    fn first_edition_name_reads_first_volume() {
        assert_eq!(
            first_edition_name(WIMINFO_OUTPUT).as_deref(),
            Some("Windows 11 Setup Media")
        );
    }
}
