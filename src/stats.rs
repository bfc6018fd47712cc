//! Plain-text status reporting for the management interface.
//!
//! Every attribute is a one-shot read rendered into a caller-provided
//! `fmt::Write`, one value per line, the way the control driver exposes
//! them as files.

use crate::cell::{Cell, CpuSet};
use crate::percpu::{CpuStat, PerCpu};
use core::fmt::{self, Write};

/// Attribute names of the per-cell statistics directory, in counter order.
pub const STAT_NAMES: [(&str, CpuStat); 10] = [
    ("vmexits_total", CpuStat::VmexitsTotal),
    ("vmexits_management", CpuStat::Management),
    ("vmexits_hypercall", CpuStat::Hypercall),
    ("vmexits_mmio", CpuStat::Mmio),
    ("vmexits_pio", CpuStat::Pio),
    ("vmexits_xapic", CpuStat::Xapic),
    ("vmexits_cr", CpuStat::Cr),
    ("vmexits_msr", CpuStat::Msr),
    ("vmexits_cpuid", CpuStat::Cpuid),
    ("vmexits_xsetbv", CpuStat::Xsetbv),
];

/// Sums one counter over the CPUs assigned to the cell. CPUs outside the
/// cell never contribute, even if the caller passes them.
pub fn cell_stat<'a>(
    cell: &Cell,
    cpus: impl IntoIterator<Item = &'a PerCpu>,
    stat: CpuStat,
) -> u64 {
    cpus.into_iter()
        .filter(|cpu| cell.cpus_assigned.contains(cpu.cpu_id))
        .map(|cpu| cpu.stats.get(stat))
        .sum()
}

pub fn write_id(out: &mut dyn Write, cell: &Cell) -> fmt::Result {
    writeln!(out, "{}", cell.id)
}

pub fn write_state(out: &mut dyn Write, cell: &Cell) -> fmt::Result {
    writeln!(out, "{}", cell.state.as_str())
}

/// CPU sets render as a hex bitmask, lowest CPU in the lowest bit.
pub fn write_cpu_mask(out: &mut dyn Write, set: CpuSet) -> fmt::Result {
    writeln!(out, "{:x}", set.bits())
}

pub fn write_stat<'a>(
    out: &mut dyn Write,
    cell: &Cell,
    cpus: impl IntoIterator<Item = &'a PerCpu>,
    stat: CpuStat,
) -> fmt::Result {
    writeln!(out, "{}", cell_stat(cell, cpus, stat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_cell, TestMem};
    use alloc::string::String;

    #[test]
    fn cell_stats_sum_only_assigned_cpus() {
        let mem = TestMem::new();
        let mut cell = test_cell(&mem);
        cell.cpus_assigned.add(0);
        cell.cpus_assigned.add(2);

        let mut cpus = alloc::vec::Vec::new();
        for id in 0..3 {
            let mut cpu = PerCpu::new(id).unwrap();
            cpu.stats.bump(CpuStat::VmexitsTotal);
            cpu.stats.bump(CpuStat::VmexitsTotal);
            cpu.stats.bump(CpuStat::Msr);
            cpus.push(cpu);
        }

        let total = cell_stat(&cell, cpus.iter().map(|c| &**c), CpuStat::VmexitsTotal);
        assert_eq!(total, 4); // cpu 1 is not assigned
        assert_eq!(cell_stat(&cell, cpus.iter().map(|c| &**c), CpuStat::Msr), 2);
        assert_eq!(cell_stat(&cell, cpus.iter().map(|c| &**c), CpuStat::Pio), 0);
    }

    #[test]
    fn attributes_render_one_value_per_line() {
        let mem = TestMem::new();
        let mut cell = test_cell(&mem);
        cell.cpus_assigned.add(0);
        cell.cpus_assigned.add(5);

        let mut out = String::new();
        write_id(&mut out, &cell).unwrap();
        assert_eq!(out, "0\n");

        out.clear();
        write_state(&mut out, &cell).unwrap();
        assert_eq!(out, "running\n");

        out.clear();
        write_cpu_mask(&mut out, cell.cpus_assigned).unwrap();
        assert_eq!(out, "21\n");

        out.clear();
        write_cpu_mask(&mut out, cell.cpus_failed).unwrap();
        assert_eq!(out, "0\n");
    }

    #[test]
    fn stat_directory_covers_every_counter() {
        use crate::percpu::NUM_CPU_STATS;
        assert_eq!(STAT_NAMES.len(), NUM_CPU_STATS);
        let mut seen = [false; NUM_CPU_STATS];
        for (_, stat) in STAT_NAMES {
            seen[stat as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
