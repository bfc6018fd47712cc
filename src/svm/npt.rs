//! Nested page tables.
//!
//! Standard 4-level long-mode format walked by hardware during guest
//! physical translation. Mappings are built at 4 KiB granularity; table
//! pages come from the embedding hypervisor's pool via [`PhysMem`].

use crate::error::{Error, Result};
use crate::platform::PhysMem;
use bitflags::bitflags;

pub const PAGE_SIZE: u64 = 4096;
const ENTRIES: u64 = 512;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_US: u64 = 1 << 2;
const PTE_PWT: u64 = 1 << 3;
const PTE_PCD: u64 = 1 << 4;
const PTE_PS: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// Access rights of a guest-physical mapping.
    pub struct MemFlags: u64 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Uncacheable device memory.
        const DEVICE  = 1 << 3;
    }
}

impl MemFlags {
    /// Nested walks are performed as user-mode accesses, so every present
    /// entry needs the US bit (APM 15.25.5).
    fn to_pte(self) -> u64 {
        let mut pte = PTE_US;
        if self.contains(MemFlags::READ) {
            pte |= PTE_PRESENT;
        }
        if self.contains(MemFlags::WRITE) {
            pte |= PTE_RW;
        }
        if !self.contains(MemFlags::EXECUTE) {
            pte |= PTE_NX;
        }
        if self.contains(MemFlags::DEVICE) {
            pte |= PTE_PWT | PTE_PCD;
        }
        pte
    }

    fn from_pte(pte: u64) -> Self {
        let mut flags = MemFlags::empty();
        if pte & PTE_PRESENT != 0 {
            flags |= MemFlags::READ;
        }
        if pte & PTE_RW != 0 {
            flags |= MemFlags::WRITE;
        }
        if pte & PTE_NX == 0 {
            flags |= MemFlags::EXECUTE;
        }
        if pte & (PTE_PWT | PTE_PCD) == PTE_PWT | PTE_PCD {
            flags |= MemFlags::DEVICE;
        }
        flags
    }
}

fn index(gpa: u64, level: u32) -> usize {
    ((gpa >> (12 + 9 * (level - 1))) & (ENTRIES - 1)) as usize
}

unsafe fn entry_ptr(mem: &dyn PhysMem, table_pa: u64, index: usize) -> *mut u64 {
    (mem.virt(table_pa) as *mut u64).add(index)
}

pub struct NestedPageTable {
    root_pa: u64,
}

impl NestedPageTable {
    pub fn new(mem: &dyn PhysMem) -> Result<Self> {
        let root_pa = mem.alloc_pages(1).ok_or(Error::OutOfMemory)?;
        Ok(Self { root_pa })
    }

    /// Value for the VMCB N_CR3 field.
    pub fn root_pa(&self) -> u64 {
        self.root_pa
    }

    /// Maps `[gpa, gpa + size)` to `[hpa, hpa + size)`. All three values
    /// must be page-aligned. Existing entries in the range are replaced.
    pub fn map(
        &mut self,
        mem: &dyn PhysMem,
        gpa: u64,
        hpa: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<()> {
        let pte_flags = flags.to_pte();
        let mut offset = 0;
        while offset < size {
            let leaf = self.walk_create(mem, gpa + offset)?;
            unsafe { leaf.write_volatile(((hpa + offset) & PTE_ADDR_MASK) | pte_flags) };
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Removes the mapping of `[gpa, gpa + size)`. Intermediate tables are
    /// kept; cells unmap and remap regions often enough that reclaiming
    /// them is not worth the extra walk.
    pub fn unmap(&mut self, mem: &dyn PhysMem, gpa: u64, size: u64) {
        let mut offset = 0;
        while offset < size {
            if let Some(leaf) = self.walk(mem, gpa + offset) {
                unsafe { leaf.write_volatile(0) };
            }
            offset += PAGE_SIZE;
        }
    }

    /// Resolves a guest-physical address. Returns the host-physical address
    /// and the mapping's access rights.
    pub fn translate(&self, mem: &dyn PhysMem, gpa: u64) -> Option<(u64, MemFlags)> {
        let pte = unsafe { self.walk(mem, gpa)?.read_volatile() };
        if pte & PTE_PRESENT == 0 {
            return None;
        }
        Some(((pte & PTE_ADDR_MASK) | (gpa & (PAGE_SIZE - 1)), MemFlags::from_pte(pte)))
    }

    /// Frees all table pages. The mapped frames themselves are untouched.
    pub fn destroy(self, mem: &dyn PhysMem) {
        free_level(mem, self.root_pa, 4);
    }

    fn walk_create(&mut self, mem: &dyn PhysMem, gpa: u64) -> Result<*mut u64> {
        let mut table_pa = self.root_pa;
        for level in (2..=4).rev() {
            let entry = unsafe { entry_ptr(mem, table_pa, index(gpa, level)) };
            let pte = unsafe { entry.read_volatile() };
            table_pa = if pte & PTE_PRESENT == 0 {
                let next = mem.alloc_pages(1).ok_or(Error::OutOfMemory)?;
                // Rights are evaluated at the leaf; keep directories fully
                // permissive.
                unsafe { entry.write_volatile(next | PTE_PRESENT | PTE_RW | PTE_US) };
                next
            } else {
                pte & PTE_ADDR_MASK
            };
        }
        Ok(unsafe { entry_ptr(mem, table_pa, index(gpa, 1)) })
    }

    fn walk(&self, mem: &dyn PhysMem, gpa: u64) -> Option<*mut u64> {
        let mut table_pa = self.root_pa;
        for level in (2..=4).rev() {
            let pte = unsafe { entry_ptr(mem, table_pa, index(gpa, level)).read_volatile() };
            if pte & PTE_PRESENT == 0 {
                return None;
            }
            table_pa = pte & PTE_ADDR_MASK;
        }
        Some(unsafe { entry_ptr(mem, table_pa, index(gpa, 1)) })
    }

    #[cfg(test)]
    pub(crate) fn leaf_entry(&self, mem: &dyn PhysMem, gpa: u64) -> Option<u64> {
        self.walk(mem, gpa).map(|p| unsafe { p.read_volatile() })
    }
}

fn free_level(mem: &dyn PhysMem, table_pa: u64, level: u32) {
    if level > 1 {
        for i in 0..ENTRIES as usize {
            let pte = unsafe { entry_ptr(mem, table_pa, i).read_volatile() };
            if pte & PTE_PRESENT != 0 && pte & PTE_PS == 0 {
                free_level(mem, pte & PTE_ADDR_MASK, level - 1);
            }
        }
    }
    mem.free_pages(table_pa, 1);
}
