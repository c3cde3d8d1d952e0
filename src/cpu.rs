// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chooses which host CPUs back the guest's vCPUs. On big.LITTLE ARM hosts
//! the guest is pinned to the performance cores; elsewhere every logical CPU
//! is used.

/// ARM part IDs for Cortex-A76 and newer performance cores (A76, A77, A78,
/// A78C, X1, X1C, A715). Efficiency cores (A55 and kin) are excluded.
const PERFORMANCE_PART_IDS: &[&str] =
    &["0xd0b", "0xd0c", "0xd0d", "0xd13", "0xd20", "0xd21", "0xd4a"];

/// How many vCPUs to give the guest, and the host CPU set to pin them to
/// when the host's cores are asymmetric.
#[derive(Debug, PartialEq)]
pub struct CpuAllocation {
    pub vcpus: u32,
    pub cpuset: Option<String>,
}

/// Reads the host topology and allocates CPUs for the guest.
pub fn allocate() -> CpuAllocation {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(cpuinfo) => allocate_from_cpuinfo(&cpuinfo),
        Err(_) => CpuAllocation {
            vcpus: num_cpus::get() as u32,
            cpuset: None,
        },
    }
}

fn allocate_from_cpuinfo(cpuinfo: &str) -> CpuAllocation {
    let cores = parse_cpuinfo(cpuinfo);
    if cores.is_empty() {
        return CpuAllocation { vcpus: num_cpus::get() as u32, cpuset: None };
    }

    let performance: Vec<u32> = cores
        .iter()
        .filter(|(_, part)| {
            part.as_deref()
                .is_some_and(|p| PERFORMANCE_PART_IDS.contains(&p))
        })
        .map(|(id, _)| *id)
        .collect();

    // Pin only when the host mixes core types; on a uniform host (or one
    // whose cpuinfo carries no part IDs at all) every core is fair game.
    if !performance.is_empty() && performance.len() < cores.len() {
        let cpuset = performance
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        CpuAllocation { vcpus: performance.len() as u32, cpuset: Some(cpuset) }
    } else {
        CpuAllocation { vcpus: cores.len() as u32, cpuset: None }
    }
}

/// Parses `/proc/cpuinfo` into (processor id, CPU part) pairs. x86 hosts
/// have no "CPU part" lines, yielding `None` parts.
fn parse_cpuinfo(cpuinfo: &str) -> Vec<(u32, Option<String>)> {
    let mut cores = Vec::new();
    let mut current: Option<u32> = None;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        if key == "processor" {
            if let Some(id) = current.take() {
                cores.push((id, None));
            }
            current = value.parse::<u32>().ok();
        } else if key == "CPU part" {
            if let Some(id) = current.take() {
                cores.push((id, Some(value.to_owned())));
            }
        }
    }

    if let Some(id) = current.take() {
        cores.push((id, None));
    }

    cores
}

#[cfg(test)]
mod test {
    use super::*;

    /// An RK3588-style topology: four A55 cores then four A76 cores.
    const BIG_LITTLE: &str = "\
processor\t: 0\nCPU part\t: 0xd05\n\n\
processor\t: 1\nCPU part\t: 0xd05\n\n\
processor\t: 2\nCPU part\t: 0xd05\n\n\
processor\t: 3\nCPU part\t: 0xd05\n\n\
processor\t: 4\nCPU part\t: 0xd0b\n\n\
processor\t: 5\nCPU part\t: 0xd0b\n\n\
processor\t: 6\nCPU part\t: 0xd0b\n\n\
processor\t: 7\nCPU part\t: 0xd0b\n";

    const UNIFORM_ARM: &str = "\
processor\t: 0\nCPU part\t: 0xd0b\n\n\
processor\t: 1\nCPU part\t: 0xd0b\n";

    const X86: &str = "\
processor\t: 0\nmodel name\t: some x86\n\n\
processor\t: 1\nmodel name\t: some x86\n";

    #[test]
    fn pins_to_performance_cores_on_asymmetric_host() {
        assert_eq!(
            allocate_from_cpuinfo(BIG_LITTLE),
            CpuAllocation { vcpus: 4, cpuset: Some("4,5,6,7".to_owned()) }
        );
    }

    #[test]
    fn uses_all_cores_on_uniform_arm_host() {
        assert_eq!(
            allocate_from_cpuinfo(UNIFORM_ARM),
            CpuAllocation { vcpus: 2, cpuset: None }
        );
    }

    #[test]
    fn uses_all_cores_when_no_part_ids() {
        assert_eq!(
            allocate_from_cpuinfo(X86),
            CpuAllocation { vcpus: 2, cpuset: None }
        );
    }
}
