// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Updates the unattended-setup answer file for the edition being installed
//! and packages it in the forms Windows Setup looks for.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    process::Command,
};

use anyhow::{Context as _, Result};
use camino::Utf8Path;

use crate::mount;
use crate::runner::Ui;
use crate::util::run_command_check_status;

/// Generic install keys, which select the edition during unattended setup
/// without activating it. Keyed by the full product name reported by
/// `wiminfo`.
const EDITION_KEYS: &[(&str, &str)] = &[
    ("Windows 11 Home", "TX9XD-98N7V-6WMQ6-BX7FG-H8Q99"),
    ("Windows 11 Pro", "VK7JG-NPHTM-C97JM-9MPGT-3V66T"),
    ("Windows 11 Pro N", "2B87N-8KFHP-DKV6R-Y2C8J-PKCKT"),
    ("Windows 11 Pro for Workstations", "DXG7C-N36C4-C4HTG-X4T3X-2YV77"),
    ("Windows 11 Pro for Workstations N", "WYPNQ-8C467-V2W6J-TX4WX-WT2RQ"),
    ("Windows 11 Pro Education", "8PTT6-RNW4C-6V7J2-C2D3X-MHBPB"),
    ("Windows 11 Pro Education N", "GJTYN-HDMQY-FRR76-HVGC7-QPF8P"),
    ("Windows 11 Education", "YNMGQ-8RYV3-4PGQ3-C8XTP-7CFBY"),
    ("Windows 11 Education N", "84NGF-MHBT6-FXBX8-QWJK7-DRR8H"),
    ("Windows 11 Enterprise", "XGVPP-NMH47-7TTHJ-W3FW7-8HV2C"),
    ("Windows 11 Enterprise N", "WGGHN-J84D6-QYCPR-T7PJ7-X766F"),
    ("Windows 11 Enterprise G", "YYVX9-NTFWV-6MDM3-9PT4T-4M68B"),
    ("Windows 11 Enterprise G N", "44RPN-FTY23-9VTTB-MP9BX-T84FV"),
    ("Windows 10 Home", "TX9XD-98N7V-6WMQ6-BX7FG-H8Q99"),
    ("Windows 10 Pro", "VK7JG-NPHTM-C97JM-9MPGT-3V66T"),
    ("Windows 10 Pro N", "2B87N-8KFHP-DKV6R-Y2C8J-PKCKT"),
    ("Windows 10 Pro for Workstations", "DXG7C-N36C4-C4HTG-X4T3X-2YV77"),
    ("Windows 10 Pro for Workstations N", "WYPNQ-8C467-V2W6J-TX4WX-WT2RQ"),
    ("Windows 10 Pro Education", "8PTT6-RNW4C-6V7J2-C2D3X-MHBPB"),
    ("Windows 10 Pro Education N", "GJTYN-HDMQY-FRR76-HVGC7-QPF8P"),
    ("Windows 10 Education", "YNMGQ-8RYV3-4PGQ3-C8XTP-7CFBY"),
    ("Windows 10 Education N", "84NGF-MHBT6-FXBX8-QWJK7-DRR8H"),
    ("Windows 10 Enterprise", "XGVPP-NMH47-7TTHJ-W3FW7-8HV2C"),
    ("Windows 10 Enterprise N", "WGGHN-J84D6-QYCPR-T7PJ7-X766F"),
    ("Windows 10 Enterprise G", "YYVX9-NTFWV-6MDM3-9PT4T-4M68B"),
    ("Windows 10 Enterprise G N", "44RPN-FTY23-9VTTB-MP9BX-T84FV"),
    ("Windows 10 Enterprise LTSC 2019", "XGVPP-NMH47-7TTHJ-W3FW7-8HV2C"),
    ("Windows 10 Enterprise LTSC 2021", "XGVPP-NMH47-7TTHJ-W3FW7-8HV2C"),
    ("Windows Server 2019 Standard", "N69G4-B89J2-4G8F4-WWYCC-J464C"),
    ("Windows Server 2019 Datacenter", "WMDGN-G9PQG-XVVXX-R3X43-63DFG"),
    ("Windows Server 2022 Standard", "VDYBN-27WPP-V4HQT-9VMD4-VMK7H"),
    ("Windows Server 2022 Datacenter", "WX4NM-KYWYW-QJJR4-XV3QB-6VM33"),
];

/// Used when the detected edition has no entry in the table; editions close
/// enough to Pro accept its key for edition selection. Same key as the
/// table's Pro entries.
pub const FALLBACK_KEY: &str = "VK7JG-NPHTM-C97JM-9MPGT-3V66T";

/// The install key for `edition` (the full product name), or `None` if the
/// edition is unknown.
pub fn key_for_edition(edition: &str) -> Option<&'static str> {
    EDITION_KEYS
        .iter()
        .find(|(name, _)| *name == edition)
        .map(|(_, key)| *key)
}

// The answer file spells the product key two ways: windowsPE UserData nests
// a Key element inside ProductKey, while the specialize pass puts the key
// directly in a ProductKey element:
//
// <UserData>
//   <ProductKey>
//     <Key>VK7JG-...</Key> <-- replace this
//   </ProductKey>
//
// <component name="Microsoft-Shell-Setup">
//   <ProductKey>VK7JG-...</ProductKey> <-- and this
//
// Bare Key elements elsewhere (e.g. /IMAGE/INDEX selectors in MetaData)
// must be left alone, so matching requires the ProductKey ancestor.

/// Streams an answer file through, replacing every product key with a new
/// one.
pub struct KeyUpdater {
    key: String,
}

impl KeyUpdater {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Rewrites the answer file at `input` into `output`, returning the
    /// number of keys replaced.
    pub fn run(
        &self,
        input: &Utf8Path,
        output: &Utf8Path,
    ) -> Result<usize> {
        let infile = File::open(input)
            .with_context(|| format!("opening answer file {input}"))?;
        let reader = xml::EventReader::new(BufReader::new(infile));
        let outfile = File::create(output)
            .with_context(|| format!("creating answer file {output}"))?;
        let writer = xml::EventWriter::new(BufWriter::new(outfile));

        self.run_internal(reader, writer)
    }

    fn run_internal<R: std::io::Read, W: std::io::Write>(
        &self,
        input: xml::EventReader<R>,
        mut output: xml::EventWriter<W>,
    ) -> Result<usize> {
        let mut matches = 0;
        let mut stack: Vec<String> = Vec::new();

        for e in input {
            let e = e.context("reading answer file")?;
            match &e {
                xml::reader::XmlEvent::StartElement { name, .. } => {
                    stack.push(name.local_name.clone());
                }
                xml::reader::XmlEvent::EndElement { .. } => {
                    stack.pop();
                }
                xml::reader::XmlEvent::Characters(_) => {
                    let in_product_key = match stack.as_slice() {
                        [.., parent] if parent == "ProductKey" => true,
                        [.., grandparent, parent] => {
                            parent == "Key" && grandparent == "ProductKey"
                        }
                        _ => false,
                    };

                    if in_product_key {
                        output.write(xml::writer::XmlEvent::Characters(
                            &self.key,
                        ))?;
                        matches += 1;
                        continue;
                    }
                }
                _ => {}
            }

            if let Some(writer_event) = e.as_writer_event() {
                output.write(writer_event)?;
            }
        }

        Ok(matches)
    }
}

/// Builds a FAT12 floppy image carrying `autounattend.xml`. Some firmware
/// and media combinations only surface the answer file to Setup via a
/// floppy, so first boot attaches one when it exists; failure to build it is
/// not fatal.
pub fn create_answer_floppy(vm_dir: &Utf8Path, ui: &Ui) -> Result<()> {
    let answer_file = vm_dir.join("unattended").join("autounattend.xml");
    let image = vm_dir.join("autounattend.img");

    run_command_check_status(
        Command::new("dd").args([
            "if=/dev/zero",
            &format!("of={image}"),
            "bs=1024",
            "count=1440",
        ]),
        ui,
    )?;

    run_command_check_status(
        Command::new("mkfs.fat").args([
            "-F",
            "12",
            "-n",
            "AUTOUNATTEND",
            image.as_str(),
        ]),
        ui,
    )?;

    let mount_dir = tempfile::tempdir()?;
    let mount_point = Utf8Path::from_path(mount_dir.path())
        .ok_or_else(|| anyhow::anyhow!("temp dir path is not UTF-8"))?;

    run_command_check_status(
        Command::new("sudo").args([
            "mount",
            "-o",
            "loop",
            image.as_str(),
            mount_point.as_str(),
        ]),
        ui,
    )?;

    let copied = run_command_check_status(
        Command::new("sudo").args([
            "cp",
            answer_file.as_str(),
            mount_point.as_str(),
        ]),
        ui,
    );

    mount::unmount_retry(mount_point);
    copied.map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;

    const ANSWER_FILE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<unattend xmlns="urn:schemas-microsoft-com:unattend">
  <settings pass="windowsPE">
    <component name="Microsoft-Windows-Setup">
      <ImageInstall>
        <OSImage>
          <InstallFrom>
            <MetaData wcm:action="add" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
              <Key>/IMAGE/INDEX</Key>
              <Value>1</Value>
            </MetaData>
          </InstallFrom>
        </OSImage>
      </ImageInstall>
      <UserData>
        <ProductKey>
          <Key>AAAAA-AAAAA-AAAAA-AAAAA-AAAAA</Key>
          <WillShowUI>OnError</WillShowUI>
        </ProductKey>
      </UserData>
    </component>
  </settings>
  <settings pass="specialize">
    <component name="Microsoft-Windows-Shell-Setup">
      <ProductKey>BBBBB-BBBBB-BBBBB-BBBBB-BBBBB</ProductKey>
    </component>
  </settings>
</unattend>
"#;

    #[test]
    fn replaces_both_key_spellings() {
        let updater = KeyUpdater::new("VK7JG-NPHTM-C97JM-9MPGT-3V66T");
        let reader = xml::EventReader::new(ANSWER_FILE.as_bytes());
        let writer = xml::EventWriter::new(Vec::new());

        let matches = updater
            .run_internal(reader, writer)
            .expect("answer file rewrites cleanly");
        assert_eq!(matches, 2);
    }

    #[test]
    fn leaves_image_index_selector_alone() {
        let updater = KeyUpdater::new("VK7JG-NPHTM-C97JM-9MPGT-3V66T");
        let reader = xml::EventReader::new(ANSWER_FILE.as_bytes());
        let mut sink = Vec::new();
        {
            let writer = xml::EventWriter::new(&mut sink);
            updater.run_internal(reader, writer).unwrap();
        }

        let rewritten = String::from_utf8(sink).unwrap();
        assert!(rewritten.contains("/IMAGE/INDEX"));
        assert!(!rewritten.contains("AAAAA-AAAAA"));
        assert!(!rewritten.contains("BBBBB-BBBBB"));
        assert_eq!(
            rewritten.matches("VK7JG-NPHTM-C97JM-9MPGT-3V66T").count(),
            2
        );
    }

    #[test]
    fn known_editions_have_keys() {
        assert_eq!(
            key_for_edition("Windows 11 Pro"),
            Some("VK7JG-NPHTM-C97JM-9MPGT-3V66T")
        );
        assert_eq!(key_for_edition("Windows 11 Home Single Language"), None);
    }

    #[test]
    fn fallback_key_is_the_pro_key() {
        assert_eq!(key_for_edition("Windows 11 Pro"), Some(FALLBACK_KEY));
        assert_eq!(key_for_edition("Windows 10 Pro"), Some(FALLBACK_KEY));
    }
}
