// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rewrites Windows installer ISOs so they boot without the "Press any key
//! to boot from CD or DVD" prompt.
//!
//! Two strategies, tried in order:
//!
//! 1. Extract the ISO, copy `efisys_noprompt.bin` over `efisys.bin`, and
//!    rebuild the image. Requires `7z` and an ISO that ships both binaries.
//! 2. Patch the image in place: locate the embedded no-prompt cdboot image
//!    by its FAT boot-sector magic and debug-string marker, then overwrite
//!    every prompting cdboot image with it. Works on ISOs whose filesystem
//!    layout resists extraction, at the cost of trusting fixed offsets.

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    process::Command,
};

use camino::Utf8Path;
use thiserror::Error;

use crate::runner::Ui;
use crate::util::run_command_check_status;

pub const EFISYS: &str = "efi/microsoft/boot/efisys.bin";
pub const EFISYS_NOPROMPT: &str = "efi/microsoft/boot/efisys_noprompt.bin";

/// Debug-path strings embedded in the two flavors of cdboot image.
const PROMPT_MARKER: &[u8] = b"cdboot.pdb";
const NOPROMPT_MARKER: &[u8] = b"cdboot_noprompt.pdb";

const SCAN_CHUNK: usize = 1 << 20;

/// Identifies a cdboot image embedded in an ISO. The image starts with a FAT
/// boot sector (`magic`) and contains a PDB path string `marker_offset` bytes
/// in; the whole image is `file_length` bytes long.
pub struct BootSignature {
    pub magic: [u8; 16],
    pub marker_offset: u64,
    pub file_length: u64,
}

/// The cdboot layout used by current Windows 10/11 installation media.
pub const CDBOOT_SIGNATURE: BootSignature = BootSignature {
    magic: [
        0xEB, 0xEC, 0x90, 0x4D, 0x53, 0x44, 0x4F, 0x53, 0x35, 0x2E, 0x30,
        0x00, 0x02, 0x02, 0x01, 0x00,
    ],
    marker_offset: 934_748,
    file_length: 1_720_320,
};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("extracted ISO has no {EFISYS_NOPROMPT}")]
    NopromptBinaryMissing,

    #[error("no boot image containing '{marker}' found in the ISO")]
    NoBootBinaryFound { marker: String },

    #[error(
        "found {candidates} '{marker}' marker(s) but none preceded by a \
         valid boot sector"
    )]
    SignatureMismatch { marker: String, candidates: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Suppresses the boot prompt in the ISO at `iso`, rebuilding the image if
/// possible and falling back to in-place patching.
pub fn suppress_boot_prompt(iso: &Utf8Path, ui: &Ui) -> anyhow::Result<()> {
    match rebuild_with_noprompt(iso, ui) {
        Ok(()) => return Ok(()),
        Err(e) => {
            log::warn!(
                "could not rebuild {iso} with the no-prompt boot binary \
                 ({e}); patching boot images in place"
            );
        }
    }

    ui.set_substep("patching boot images in place");
    let mut file = OpenOptions::new().read(true).write(true).open(iso)?;
    let replaced = patch_boot_images(
        &mut file,
        &CDBOOT_SIGNATURE,
        NOPROMPT_MARKER,
        PROMPT_MARKER,
        SCAN_CHUNK,
    )?;

    log::info!("replaced {replaced} prompting boot image(s) in {iso}");
    Ok(())
}

/// Strategy 1: extract the ISO, swap in the no-prompt EFI boot binary, and
/// rebuild the image in place.
fn rebuild_with_noprompt(iso: &Utf8Path, ui: &Ui) -> anyhow::Result<()> {
    which::which("7z")
        .map_err(|_| anyhow::anyhow!("7z not found on this system"))?;

    let extract_dir = tempfile::tempdir()?;
    let extract_path = Utf8Path::from_path(extract_dir.path())
        .ok_or_else(|| anyhow::anyhow!("temp dir path is not UTF-8"))?;

    ui.set_substep(format!("extracting {iso}"));
    run_command_check_status(
        Command::new("7z").args([
            "x",
            iso.as_str(),
            &format!("-o{extract_path}"),
        ]),
        ui,
    )?;

    let noprompt = extract_path.join(EFISYS_NOPROMPT);
    let efisys = extract_path.join(EFISYS);
    if !noprompt.exists() || !efisys.exists() {
        return Err(PatchError::NopromptBinaryMissing.into());
    }

    std::fs::copy(&noprompt, &efisys)?;

    let rebuilt = iso.with_extension("iso.tmp");
    build_iso_from_tree(extract_path, &rebuilt, ui)?;
    std::fs::rename(&rebuilt, iso)?;
    Ok(())
}

/// Packs `source_dir` into a UDF/ISO-9660 hybrid image that EFI-boots via
/// `efisys.bin`. Shared with the media-building pipeline.
pub fn build_iso_from_tree(
    source_dir: &Utf8Path,
    output: &Utf8Path,
    ui: &Ui,
) -> anyhow::Result<()> {
    run_command_check_status(
        Command::new("genisoimage")
            .args([
                "-o",
                output.as_str(),
                "-R",
                "-iso-level",
                "3",
                "-udf",
                "-b",
                EFISYS,
                "-no-emul-boot",
                "-V",
                "ESD_ISO",
                "-allow-limited-size",
                ".",
            ])
            .current_dir(source_dir),
        ui,
    )
    .map(|_| ())
}

/// Strategy 2: overwrite every verified prompting cdboot image in `file`
/// with the no-prompt one, returning the number of images replaced.
fn patch_boot_images<F: Read + Write + Seek>(
    file: &mut F,
    sig: &BootSignature,
    noprompt_marker: &[u8],
    prompt_marker: &[u8],
    chunk_size: usize,
) -> Result<usize, PatchError> {
    let file_len = file.seek(SeekFrom::End(0))?;

    let payload_start =
        find_boot_images(file, sig, noprompt_marker, chunk_size, file_len)?[0];

    let mut payload = vec![0u8; sig.file_length as usize];
    file.seek(SeekFrom::Start(payload_start))?;
    file.read_exact(&mut payload)?;

    let targets =
        find_boot_images(file, sig, prompt_marker, chunk_size, file_len)?;

    let mut replaced = 0;
    for start in targets {
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&payload)?;
        replaced += 1;
    }

    Ok(replaced)
}

/// Scans the whole stream for `marker` and returns the (non-empty) start
/// offsets of the images whose boot-sector magic checks out.
fn find_boot_images<R: Read + Seek>(
    file: &mut R,
    sig: &BootSignature,
    marker: &[u8],
    chunk_size: usize,
    file_len: u64,
) -> Result<Vec<u64>, PatchError> {
    let candidates = find_marker_offsets(file, marker, chunk_size)?;
    if candidates.is_empty() {
        return Err(PatchError::NoBootBinaryFound {
            marker: String::from_utf8_lossy(marker).into_owned(),
        });
    }

    let mut verified = Vec::new();
    for marker_pos in &candidates {
        // The marker sits a fixed distance into the image; anything closer
        // to the start of the ISO than that can't be one.
        let Some(start) = marker_pos.checked_sub(sig.marker_offset) else {
            continue;
        };
        if start + sig.file_length > file_len {
            continue;
        }

        let mut magic = [0u8; 16];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut magic)?;
        if magic == sig.magic {
            verified.push(start);
        }
    }

    if verified.is_empty() {
        return Err(PatchError::SignatureMismatch {
            marker: String::from_utf8_lossy(marker).into_owned(),
            candidates: candidates.len(),
        });
    }

    Ok(verified)
}

/// Streams through `file` in `chunk_size` pieces looking for `marker`,
/// carrying a marker-sized tail across chunk boundaries so matches that
/// straddle a boundary are still found.
fn find_marker_offsets<R: Read + Seek>(
    file: &mut R,
    marker: &[u8],
    chunk_size: usize,
) -> std::io::Result<Vec<u64>> {
    file.seek(SeekFrom::Start(0))?;

    let mut offsets = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let mut consumed: u64 = 0;
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let n = read_fill(file, &mut chunk)?;
        if n == 0 {
            break;
        }

        let mut window = carry.clone();
        window.extend_from_slice(&chunk[..n]);
        let window_base = consumed - carry.len() as u64;

        for idx in find_all(&window, marker) {
            offsets.push(window_base + idx as u64);
        }

        consumed += n as u64;
        let tail = window.len().saturating_sub(marker.len() - 1);
        carry = window.split_off(tail);

        if n < chunk_size {
            break;
        }
    }

    Ok(offsets)
}

/// Reads until `buf` is full or the stream ends, returning the number of
/// bytes read.
fn read_fill<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(filled)
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return Vec::new();
    }

    (0..=haystack.len() - needle.len())
        .filter(|&i| &haystack[i..i + needle.len()] == needle)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    const TEST_SIG: BootSignature = BootSignature {
        magic: CDBOOT_SIGNATURE.magic,
        marker_offset: 64,
        file_length: 128,
    };

    // Chosen so neither marker is a substring of the other, like the real
    // pair.
    const NOPROMPT: &[u8] = b"SILENT.pdb";
    const PROMPT: &[u8] = b"PROMPT.pdb";

    /// Builds a 128-byte boot image: magic, fill, marker at offset 64.
    fn boot_image(marker: &[u8], fill: u8) -> Vec<u8> {
        let mut img = vec![fill; TEST_SIG.file_length as usize];
        img[..16].copy_from_slice(&TEST_SIG.magic);
        img[64..64 + marker.len()].copy_from_slice(marker);
        img
    }

    /// Lays out images at the given offsets in a zero-filled buffer.
    fn layout(len: usize, images: &[(usize, Vec<u8>)]) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        for (at, img) in images {
            buf[*at..*at + img.len()].copy_from_slice(img);
        }
        buf
    }

    #[test]
    fn replaces_all_prompting_images() {
        let noprompt = boot_image(NOPROMPT, 0xAA);
        let prompt = boot_image(PROMPT, 0xBB);
        let buf = layout(
            2048,
            &[
                (100, noprompt.clone()),
                (400, prompt.clone()),
                (900, prompt.clone()),
            ],
        );

        let mut cursor = Cursor::new(buf);
        let replaced = patch_boot_images(
            &mut cursor, &TEST_SIG, NOPROMPT, PROMPT, 256,
        )
        .unwrap();

        assert_eq!(replaced, 2);
        let patched = cursor.into_inner();
        assert_eq!(&patched[400..528], noprompt.as_slice());
        assert_eq!(&patched[900..1028], noprompt.as_slice());
        // The source image itself is untouched.
        assert_eq!(&patched[100..228], noprompt.as_slice());
    }

    #[test]
    fn finds_marker_straddling_chunk_boundary() {
        // Chunk size 256 puts a boundary at 512; a marker at 505 spans it.
        let noprompt = boot_image(NOPROMPT, 0xAA);
        let prompt = boot_image(PROMPT, 0xBB);
        let marker_at = 505usize;
        let image_at = marker_at - TEST_SIG.marker_offset as usize;
        let buf =
            layout(2048, &[(image_at, prompt), (1200, noprompt.clone())]);

        let mut cursor = Cursor::new(buf);
        let replaced = patch_boot_images(
            &mut cursor, &TEST_SIG, NOPROMPT, PROMPT, 256,
        )
        .unwrap();

        assert_eq!(replaced, 1);
        let patched = cursor.into_inner();
        assert_eq!(&patched[image_at..image_at + 128], noprompt.as_slice());
    }

    #[test]
    fn marker_without_magic_is_not_replaced() {
        let noprompt = boot_image(NOPROMPT, 0xAA);
        // A decoy: the marker string appears but no boot sector precedes it.
        let mut decoy = boot_image(PROMPT, 0xCC);
        decoy[..16].copy_from_slice(&[0u8; 16]);

        let real_prompt = boot_image(PROMPT, 0xBB);
        let buf = layout(
            2048,
            &[(100, noprompt), (400, decoy.clone()), (900, real_prompt)],
        );

        let mut cursor = Cursor::new(buf);
        let replaced = patch_boot_images(
            &mut cursor, &TEST_SIG, NOPROMPT, PROMPT, 256,
        )
        .unwrap();

        assert_eq!(replaced, 1);
        assert_eq!(&cursor.into_inner()[400..528], decoy.as_slice());
    }

    #[test]
    fn all_decoys_is_a_signature_mismatch() {
        let noprompt = boot_image(NOPROMPT, 0xAA);
        let mut decoy = boot_image(PROMPT, 0xCC);
        decoy[..16].copy_from_slice(&[0u8; 16]);
        let buf = layout(2048, &[(100, noprompt), (400, decoy)]);

        let err = patch_boot_images(
            &mut Cursor::new(buf),
            &TEST_SIG,
            NOPROMPT,
            PROMPT,
            256,
        )
        .unwrap_err();

        assert!(matches!(err, PatchError::SignatureMismatch { .. }));
    }

    #[test]
    fn missing_prompt_image_is_an_error() {
        let buf = layout(2048, &[(100, boot_image(NOPROMPT, 0xAA))]);
        let err = patch_boot_images(
            &mut Cursor::new(buf),
            &TEST_SIG,
            NOPROMPT,
            PROMPT,
            256,
        )
        .unwrap_err();

        assert!(matches!(err, PatchError::NoBootBinaryFound { .. }));
    }

    #[test]
    fn missing_noprompt_image_is_an_error() {
        let buf = layout(2048, &[(100, boot_image(PROMPT, 0xBB))]);
        let err = patch_boot_images(
            &mut Cursor::new(buf),
            &TEST_SIG,
            NOPROMPT,
            PROMPT,
            256,
        )
        .unwrap_err();

        assert!(matches!(err, PatchError::NoBootBinaryFound { .. }));
    }
}
