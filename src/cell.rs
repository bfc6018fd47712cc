//! Cells: static partitions owning disjoint sets of CPUs and memory.
//!
//! The vCPU backend only needs the per-cell address-space configuration
//! (nested page table, I/O permission bitmap) and enough bookkeeping to
//! report cell status to the management layer.

use crate::error::{Error, Result};
use crate::platform::PhysMem;
use crate::svm::npt::{MemFlags, NestedPageTable, PAGE_SIZE};
use crate::svm::XAPIC_BASE;
use alloc::string::String;

/// Set of physical CPU ids, as a bitmask. The backend supports up to 64
/// CPUs, same as the configuration format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn add(&mut self, cpu: u32) {
        debug_assert!(cpu < 64);
        self.0 |= 1 << cpu;
    }

    pub fn remove(&mut self, cpu: u32) {
        debug_assert!(cpu < 64);
        self.0 &= !(1 << cpu);
    }

    pub fn contains(&self, cpu: u32) -> bool {
        debug_assert!(cpu < 64);
        self.0 & (1 << cpu) != 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |cpu| self.contains(*cpu))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Running,
    RunningLocked,
    ShutDown,
    Failed,
}

impl CellState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellState::Running => "running",
            CellState::RunningLocked => "running/locked",
            CellState::ShutDown => "shut down",
            CellState::Failed => "failed",
        }
    }
}

pub struct Cell {
    pub id: u32,
    pub name: String,
    pub state: CellState,
    pub cpus_assigned: CpuSet,
    /// CPUs that hit an unrecoverable condition and were parked.
    pub cpus_failed: CpuSet,

    npt: NestedPageTable,
    /// I/O permission bitmap: two 4 KiB pages plus the trailing three bits,
    /// all-ones so every port access traps.
    pub iopm_pa: u64,
}

impl Cell {
    /// `avic_page_pa` is the shared APIC backing page on parts with AVIC;
    /// without it the physical xAPIC page is mapped read-only so that only
    /// writes trap.
    pub fn new(
        id: u32,
        name: &str,
        mem: &dyn PhysMem,
        avic_page_pa: Option<u64>,
    ) -> Result<Self> {
        let iopm_pa = mem.alloc_pages(3).ok_or(Error::OutOfMemory)?;
        unsafe { core::ptr::write_bytes(mem.virt(iopm_pa), 0xff, 3 * PAGE_SIZE as usize) };

        let mut npt = NestedPageTable::new(mem)?;
        match avic_page_pa {
            Some(pa) => npt.map(
                mem,
                XAPIC_BASE,
                pa,
                PAGE_SIZE,
                MemFlags::READ | MemFlags::WRITE | MemFlags::DEVICE,
            )?,
            None => npt.map(
                mem,
                XAPIC_BASE,
                XAPIC_BASE,
                PAGE_SIZE,
                MemFlags::READ | MemFlags::DEVICE,
            )?,
        }

        Ok(Self {
            id,
            name: String::from(name),
            state: CellState::Running,
            cpus_assigned: CpuSet::empty(),
            cpus_failed: CpuSet::empty(),
            npt,
            iopm_pa,
        })
    }

    pub fn npt_root_pa(&self) -> u64 {
        self.npt.root_pa()
    }

    /// Adds `[gpa, gpa + size)` to the cell's guest-physical address space.
    pub fn map_memory(
        &mut self,
        mem: &dyn PhysMem,
        gpa: u64,
        hpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()> {
        self.npt.map(mem, gpa, hpa, size, flags)
    }

    pub fn unmap_memory(&mut self, mem: &dyn PhysMem, gpa: u64, size: u64) {
        self.npt.unmap(mem, gpa, size)
    }

    pub fn translate(&self, mem: &dyn PhysMem, gpa: u64) -> Option<(u64, MemFlags)> {
        self.npt.translate(mem, gpa)
    }

    /// Tears down the cell's address-space structures.
    pub fn destroy(mut self, mem: &dyn PhysMem) {
        self.npt.unmap(mem, XAPIC_BASE, PAGE_SIZE);
        self.npt.destroy(mem);
        mem.free_pages(self.iopm_pa, 3);
    }
}
