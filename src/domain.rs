// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Defines, starts, monitors, and tears down the libvirt domain that runs
//! Windows Setup. All control goes through `virsh` against the per-user
//! session daemon.

use std::process::Command;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::cpu::CpuAllocation;
use crate::runner::Ui;
use crate::util::{run_command_check_status, run_command_check_status_logged};

const LIBVIRT_URI: &str = "qemu:///session";
const STATE_POLL_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(30);

fn virsh() -> Command {
    let mut cmd = Command::new("virsh");
    cmd.args(["-c", LIBVIRT_URI]);
    cmd
}

/// The domain name prefix for a VM's installation domain. Stale domains with
/// this prefix are torn down before a new one is defined.
pub fn domain_base_name(vm_name: &str) -> String {
    format!("bvm-firstboot-{vm_name}")
}

/// What `virsh domstate` reports about a domain. A domain that is defined
/// but was never started also reports "shut off", so callers that care about
/// "finished running" must only poll after a successful start.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainState {
    Running,
    ShutOff,
    Crashed,
    Paused,
    Other(String),
}

impl DomainState {
    pub fn parse(domstate_output: &str) -> Self {
        match domstate_output.trim() {
            "running" => Self::Running,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "paused" => Self::Paused,
            other => Self::Other(other.to_owned()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[allow(non_camel_case_types)]
pub enum GuestArch {
    Aarch64,
    X86_64,
}

impl GuestArch {
    pub fn host() -> Self {
        if std::env::consts::ARCH == "aarch64" {
            Self::Aarch64
        } else {
            Self::X86_64
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::X86_64 => "x86_64",
        }
    }

    fn machine(&self) -> &'static str {
        match self {
            Self::Aarch64 => "virt",
            Self::X86_64 => "q35",
        }
    }

    fn loader(&self) -> &'static str {
        match self {
            Self::Aarch64 => "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
            Self::X86_64 => "/usr/share/OVMF/OVMF_CODE_4M.fd",
        }
    }

    fn emulator(&self) -> &'static str {
        match self {
            Self::Aarch64 => "/usr/bin/qemu-system-aarch64",
            Self::X86_64 => "/usr/bin/qemu-system-x86_64",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DiskKind {
    Disk,
    Cdrom,
    Floppy,
}

impl DiskKind {
    fn device(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Cdrom => "cdrom",
            Self::Floppy => "floppy",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiskBus {
    Virtio,
    Ide,
    Sata,
    Scsi,
    Fdc,
}

impl DiskBus {
    fn name(&self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::Ide => "ide",
            Self::Sata => "sata",
            Self::Scsi => "scsi",
            Self::Fdc => "fdc",
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiskAttachment {
    pub source: Utf8PathBuf,
    pub kind: DiskKind,
    pub bus: DiskBus,
    pub target: &'static str,
    pub format: &'static str,
    pub boot_order: Option<u32>,
    pub read_only: bool,
}

/// Everything needed to render the installation domain's XML.
pub struct VmDescriptor {
    pub name: String,
    pub memory_gib: u32,
    pub vcpus: u32,
    pub cpuset: Option<String>,
    pub arch: GuestArch,
    pub disks: Vec<DiskAttachment>,
}

impl VmDescriptor {
    /// Builds the descriptor for a first-boot installation run from the
    /// files in `vm_dir`.
    ///
    /// The answer-file ISO is attached on three different buses (IDE, SATA,
    /// and SCSI) because Windows Setup only scans drives it has drivers for,
    /// and which buses those are varies by Windows version and architecture.
    /// The installer boots first; afterwards the freshly-written system disk
    /// takes over.
    pub fn first_boot(
        vm_dir: &Utf8Path,
        vm_name: &str,
        memory_gib: u32,
        cpus: CpuAllocation,
        arch: GuestArch,
    ) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut disks = vec![
            DiskAttachment {
                source: vm_dir.join("disk.qcow2"),
                kind: DiskKind::Disk,
                bus: DiskBus::Virtio,
                target: "vda",
                format: "qcow2",
                boot_order: Some(2),
                read_only: false,
            },
            DiskAttachment {
                source: vm_dir.join("installer.iso"),
                kind: DiskKind::Cdrom,
                bus: DiskBus::Ide,
                target: "hda",
                format: "raw",
                boot_order: Some(1),
                read_only: true,
            },
            DiskAttachment {
                source: vm_dir.join("unattended.iso"),
                kind: DiskKind::Cdrom,
                bus: DiskBus::Ide,
                target: "hdb",
                format: "raw",
                boot_order: None,
                read_only: true,
            },
            DiskAttachment {
                source: vm_dir.join("unattended.iso"),
                kind: DiskKind::Cdrom,
                bus: DiskBus::Sata,
                target: "sda",
                format: "raw",
                boot_order: None,
                read_only: true,
            },
            DiskAttachment {
                source: vm_dir.join("unattended.iso"),
                kind: DiskKind::Cdrom,
                bus: DiskBus::Scsi,
                target: "sdb",
                format: "raw",
                boot_order: None,
                read_only: true,
            },
        ];

        let floppy = vm_dir.join("autounattend.img");
        if floppy.exists() {
            disks.push(DiskAttachment {
                source: floppy,
                kind: DiskKind::Floppy,
                bus: DiskBus::Fdc,
                target: "fda",
                format: "raw",
                boot_order: None,
                read_only: true,
            });
        }

        Self {
            name: format!("{}-{timestamp}", domain_base_name(vm_name)),
            memory_gib,
            vcpus: cpus.vcpus,
            cpuset: cpus.cpuset,
            arch,
            disks,
        }
    }

    /// Renders the descriptor as libvirt domain XML.
    pub fn to_xml(&self) -> Result<String> {
        let mut out = Vec::new();
        let mut w = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(false)
            .create_writer(&mut out);

        start(&mut w, "domain", &[("type", "kvm")])?;
        text_elem(&mut w, "name", &[], &self.name)?;
        text_elem(
            &mut w,
            "memory",
            &[("unit", "GiB")],
            &self.memory_gib.to_string(),
        )?;

        {
            let mut attrs = vec![("placement", "static".to_owned())];
            if let Some(cpuset) = &self.cpuset {
                attrs.push(("cpuset", cpuset.clone()));
            }
            let attrs: Vec<(&str, &str)> =
                attrs.iter().map(|(k, v)| (*k, v.as_str())).collect();
            text_elem(&mut w, "vcpu", &attrs, &self.vcpus.to_string())?;
        }

        start(&mut w, "os", &[])?;
        text_elem(
            &mut w,
            "type",
            &[("arch", self.arch.name()), ("machine", self.arch.machine())],
            "hvm",
        )?;
        text_elem(
            &mut w,
            "loader",
            &[("readonly", "yes"), ("type", "pflash")],
            self.arch.loader(),
        )?;
        end(&mut w)?;

        start(&mut w, "features", &[])?;
        empty_elem(&mut w, "acpi", &[])?;
        if self.arch == GuestArch::Aarch64 {
            empty_elem(&mut w, "gic", &[("version", "2")])?;
        } else {
            empty_elem(&mut w, "apic", &[])?;
        }
        end(&mut w)?;

        empty_elem(&mut w, "cpu", &[("mode", "host-passthrough")])?;

        // Windows keeps the hardware clock in local time.
        start(&mut w, "clock", &[("offset", "localtime")])?;
        empty_elem(
            &mut w,
            "timer",
            &[("name", "rtc"), ("tickpolicy", "catchup")],
        )?;
        empty_elem(
            &mut w,
            "timer",
            &[("name", "pit"), ("tickpolicy", "delay")],
        )?;
        empty_elem(&mut w, "timer", &[("name", "hpet"), ("present", "no")])?;
        end(&mut w)?;

        // Setup reboots the guest several times; the final shutdown from
        // the answer file's post-install script is what ends the domain.
        text_elem(&mut w, "on_poweroff", &[], "destroy")?;
        text_elem(&mut w, "on_reboot", &[], "restart")?;
        text_elem(&mut w, "on_crash", &[], "restart")?;

        start(&mut w, "devices", &[])?;
        // Pin the emulator binary rather than leaving the choice to the
        // daemon's capability resolution.
        text_elem(&mut w, "emulator", &[], self.arch.emulator())?;
        for disk in &self.disks {
            self.write_disk(&mut w, disk)?;
        }

        empty_elem(&mut w, "controller", &[("type", "usb"), ("model", "qemu-xhci")])?;
        empty_elem(
            &mut w,
            "controller",
            &[("type", "pci"), ("model", "pcie-root")],
        )?;
        empty_elem(&mut w, "controller", &[("type", "ide")])?;
        empty_elem(&mut w, "controller", &[("type", "sata")])?;
        empty_elem(
            &mut w,
            "controller",
            &[("type", "scsi"), ("model", "virtio-scsi")],
        )?;
        empty_elem(&mut w, "controller", &[("type", "fdc")])?;

        start(&mut w, "interface", &[("type", "user")])?;
        empty_elem(&mut w, "model", &[("type", "virtio")])?;
        end(&mut w)?;

        start(
            &mut w,
            "graphics",
            &[("type", "spice"), ("autoport", "yes"), ("listen", "127.0.0.1")],
        )?;
        end(&mut w)?;

        start(&mut w, "video", &[])?;
        empty_elem(&mut w, "model", &[("type", "virtio")])?;
        end(&mut w)?;

        empty_elem(&mut w, "memballoon", &[("model", "virtio")])?;

        end(&mut w)?; // devices
        end(&mut w)?; // domain

        Ok(String::from_utf8(out)?)
    }

    fn write_disk<W: std::io::Write>(
        &self,
        w: &mut EventWriter<W>,
        disk: &DiskAttachment,
    ) -> Result<()> {
        start(
            w,
            "disk",
            &[("type", "file"), ("device", disk.kind.device())],
        )?;

        if disk.kind == DiskKind::Disk {
            empty_elem(
                w,
                "driver",
                &[
                    ("name", "qemu"),
                    ("type", disk.format),
                    ("cache", "none"),
                    ("io", "threads"),
                    ("discard", "unmap"),
                ],
            )?;
        } else {
            empty_elem(w, "driver", &[("name", "qemu"), ("type", disk.format)])?;
        }

        empty_elem(w, "source", &[("file", disk.source.as_str())])?;
        empty_elem(
            w,
            "target",
            &[("dev", disk.target), ("bus", disk.bus.name())],
        )?;

        if let Some(order) = disk.boot_order {
            empty_elem(w, "boot", &[("order", &order.to_string())])?;
        }
        if disk.read_only {
            empty_elem(w, "readonly", &[])?;
        }

        end(w)?;
        Ok(())
    }
}

fn start<W: std::io::Write>(
    w: &mut EventWriter<W>,
    name: &str,
    attrs: &[(&str, &str)],
) -> Result<()> {
    let mut ev = XmlEvent::start_element(name);
    for (k, v) in attrs {
        ev = ev.attr(*k, v);
    }
    w.write(ev)?;
    Ok(())
}

fn end<W: std::io::Write>(w: &mut EventWriter<W>) -> Result<()> {
    w.write(XmlEvent::end_element())?;
    Ok(())
}

fn text_elem<W: std::io::Write>(
    w: &mut EventWriter<W>,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> Result<()> {
    start(w, name, attrs)?;
    w.write(XmlEvent::characters(text))?;
    end(w)
}

fn empty_elem<W: std::io::Write>(
    w: &mut EventWriter<W>,
    name: &str,
    attrs: &[(&str, &str)],
) -> Result<()> {
    start(w, name, attrs)?;
    end(w)
}

/// A defined (and possibly running) installation domain. Torn down exactly
/// once, either by an explicit [`cleanup`] or on drop, so an error anywhere
/// in the installation flow can't leak a domain.
///
/// [`cleanup`]: DomainHandle::cleanup
pub struct DomainHandle {
    name: String,
    cleaned: bool,
}

impl DomainHandle {
    /// Writes the descriptor's XML into `vm_dir`, defines the domain, and
    /// starts it.
    pub fn define_and_start(
        descriptor: &VmDescriptor,
        vm_dir: &Utf8Path,
        ui: &Ui,
    ) -> Result<Self> {
        let xml_path = vm_dir.join("domain.xml");
        std::fs::write(&xml_path, descriptor.to_xml()?)
            .with_context(|| format!("writing domain XML to {xml_path}"))?;

        run_command_check_status(
            virsh().args(["define", xml_path.as_str()]),
            ui,
        )?;

        let mut handle =
            Self { name: descriptor.name.clone(), cleaned: false };

        if let Err(e) = run_command_check_status(
            virsh().args(["start", &descriptor.name]),
            ui,
        ) {
            handle.cleanup();
            return Err(e.context("starting installation domain"));
        }

        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Result<DomainState> {
        let output = run_command_check_status_logged(
            virsh().args(["domstate", &self.name]),
        )?;

        Ok(DomainState::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Polls the domain until Windows Setup powers it off. The guest's
    /// answer file ends with a shutdown command, so "shut off" means the
    /// installation ran to completion. There is no overall timeout; an
    /// installation can legitimately take hours on slow media.
    pub fn wait_for_shutdown(&self, ui: &Ui) -> Result<()> {
        loop {
            match self.state()? {
                DomainState::ShutOff => return Ok(()),
                DomainState::Crashed => {
                    anyhow::bail!(
                        "domain {} crashed during installation",
                        self.name
                    );
                }
                state => {
                    ui.set_substep(format!(
                        "installation in progress (domain is {state:?})"
                    ));
                }
            }

            std::thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    /// Opens a graphical console for the domain on a background thread.
    /// Purely cosmetic; any failure is logged and forgotten.
    pub fn launch_viewer(&self) {
        let name = self.name.clone();
        std::thread::spawn(move || {
            // Give the domain a moment to allocate its SPICE port.
            std::thread::sleep(std::time::Duration::from_secs(2));

            let uri = match run_command_check_status_logged(
                virsh().args(["domdisplay", &name]),
            ) {
                Ok(output) => {
                    String::from_utf8_lossy(&output.stdout).trim().to_owned()
                }
                Err(e) => {
                    log::debug!("no display URI for {name}: {e}");
                    return;
                }
            };

            if which::which("remote-viewer").is_ok() {
                let _ = Command::new("remote-viewer").arg(&uri).spawn();
            } else if which::which("virt-viewer").is_ok() {
                let _ = Command::new("virt-viewer")
                    .args(["-c", LIBVIRT_URI, &name])
                    .spawn();
            } else {
                log::debug!(
                    "no SPICE viewer installed; connect to {uri} manually"
                );
            }
        });
    }

    /// Destroys and undefines the domain. Failures here are warnings; by
    /// the time cleanup runs the installation outcome is already decided.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        cleanup_domain(&self.name);
    }
}

impl Drop for DomainHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Tears down leftover installation domains for `vm_name` from earlier,
/// interrupted runs.
pub fn remove_stale_domains(vm_name: &str, ui: &Ui) -> Result<()> {
    let base = domain_base_name(vm_name);
    let output = run_command_check_status(
        virsh().args(["list", "--all", "--name"]),
        ui,
    )?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let name = line.trim();
        if is_stale_domain(name, &base) {
            log::warn!("removing stale installation domain {name}");
            cleanup_domain(name);
        }
    }

    Ok(())
}

/// Whether `name` is an installation domain for the VM whose base name is
/// `base`. Domain names append a numeric timestamp to the base, so the
/// suffix must be all digits: VM `myvm` must not claim the domains of a
/// sibling VM `myvm-2`.
fn is_stale_domain(name: &str, base: &str) -> bool {
    if name == base {
        return true;
    }

    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| {
            !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit())
        })
}

fn cleanup_domain(name: &str) {
    let running = run_command_check_status_logged(
        virsh().args(["domstate", name]),
    )
    .map(|output| {
        DomainState::parse(&String::from_utf8_lossy(&output.stdout))
            == DomainState::Running
    })
    .unwrap_or(false);

    if running {
        if let Err(e) =
            run_command_check_status_logged(virsh().args(["destroy", name]))
        {
            log::warn!("failed to destroy domain {name}: {e}");
        }
    }

    // Older libvirt daemons reject flags they don't know, so retry with
    // progressively fewer of them.
    let flag_sets: &[&[&str]] = &[
        &["--managed-save", "--snapshots-metadata", "--nvram"],
        &["--managed-save", "--snapshots-metadata"],
        &[],
    ];

    for flags in flag_sets {
        let mut cmd = virsh();
        cmd.args(["undefine", name]);
        cmd.args(*flags);
        if run_command_check_status_logged(&mut cmd).is_ok() {
            return;
        }
    }

    log::warn!("failed to undefine domain {name}");
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn descriptor(vm_dir: &Utf8Path) -> VmDescriptor {
        VmDescriptor::first_boot(
            vm_dir,
            "myvm",
            4,
            CpuAllocation { vcpus: 4, cpuset: Some("4,5,6,7".to_owned()) },
            GuestArch::Aarch64,
        )
    }

    #[test]
    fn domain_name_has_expected_prefix() {
        assert_eq!(domain_base_name("myvm"), "bvm-firstboot-myvm");

        let dir = tempfile::tempdir().unwrap();
        let desc = descriptor(Utf8Path::from_path(dir.path()).unwrap());
        assert!(desc.name.starts_with("bvm-firstboot-myvm-"));
    }

    #[test]
    fn answer_iso_rides_at_least_three_buses() {
        let dir = tempfile::tempdir().unwrap();
        let desc = descriptor(Utf8Path::from_path(dir.path()).unwrap());

        let buses: HashSet<DiskBus> = desc
            .disks
            .iter()
            .filter(|d| d.source.as_str().ends_with("unattended.iso"))
            .map(|d| d.bus)
            .collect();

        assert!(buses.len() >= 3, "buses: {buses:?}");
    }

    #[test]
    fn installer_boots_first() {
        let dir = tempfile::tempdir().unwrap();
        let desc = descriptor(Utf8Path::from_path(dir.path()).unwrap());

        let installer = desc
            .disks
            .iter()
            .find(|d| d.source.as_str().ends_with("installer.iso"))
            .unwrap();
        assert_eq!(installer.kind, DiskKind::Cdrom);
        assert_eq!(installer.boot_order, Some(1));

        let others_first: Vec<_> = desc
            .disks
            .iter()
            .filter(|d| d.boot_order == Some(1))
            .collect();
        assert_eq!(others_first.len(), 1);
    }

    #[test]
    fn floppy_attached_only_when_image_exists() {
        let dir = tempfile::tempdir().unwrap();
        let vm_dir = Utf8Path::from_path(dir.path()).unwrap();

        let desc = descriptor(vm_dir);
        assert!(!desc.disks.iter().any(|d| d.kind == DiskKind::Floppy));

        std::fs::write(vm_dir.join("autounattend.img"), b"").unwrap();
        let desc = descriptor(vm_dir);
        assert!(desc.disks.iter().any(|d| d.kind == DiskKind::Floppy));
    }

    #[test]
    fn xml_carries_cpuset_and_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let desc = descriptor(Utf8Path::from_path(dir.path()).unwrap());
        let xml = desc.to_xml().unwrap();

        assert!(xml.contains("cpuset=\"4,5,6,7\""));
        assert!(xml.contains(
            "<emulator>/usr/bin/qemu-system-aarch64</emulator>"
        ));
        assert!(xml.contains("qemu-efi-aarch64/QEMU_EFI.fd"));
        assert!(xml.contains("machine=\"virt\""));
        assert!(xml.contains("gic version=\"2\""));
        assert!(xml.contains("<on_poweroff>destroy</on_poweroff>"));
    }

    #[test]
    fn cleanup_twice_is_safe() {
        // Teardown failures are warnings, so this holds even with no
        // libvirt daemon around to talk to.
        let mut handle = DomainHandle {
            name: "bvm-firstboot-myvm-0".to_owned(),
            cleaned: false,
        };
        handle.cleanup();
        assert!(handle.cleaned);
        handle.cleanup();
    }

    #[test]
    fn stale_sweep_only_claims_own_domains() {
        let base = domain_base_name("myvm");
        assert!(is_stale_domain("bvm-firstboot-myvm", &base));
        assert!(is_stale_domain("bvm-firstboot-myvm-1756500000", &base));

        // A sibling VM directory's domains share the prefix but carry a
        // non-numeric suffix relative to this base.
        assert!(!is_stale_domain("bvm-firstboot-myvm-2-1756500000", &base));
        assert!(!is_stale_domain("bvm-firstboot-other", &base));
        assert!(!is_stale_domain("bvm-firstboot-myvm-", &base));

        let sibling = domain_base_name("myvm-2");
        assert!(is_stale_domain("bvm-firstboot-myvm-2-1756500000", &sibling));
    }

    #[test]
    fn parses_domstate_output() {
        assert_eq!(DomainState::parse("running\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off\n\n"), DomainState::ShutOff);
        assert_eq!(DomainState::parse("crashed"), DomainState::Crashed);
        assert_eq!(
            DomainState::parse("pmsuspended"),
            DomainState::Other("pmsuspended".to_owned())
        );
    }
}
