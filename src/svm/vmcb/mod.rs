//! Virtual machine control block.

pub mod control_area;
pub mod save_area;

use crate::cell::Cell;
use crate::percpu::{HostState, NUM_ENTRY_REGS};
use crate::platform::PhysMem;
use crate::svm::msr::{
    DR6_RESET_VALUE, DR7_RESET_VALUE, EFER_SVME, PAT_RESET_VALUE, RFLAGS_RESET_VALUE,
    SVM_CR0_ALLOWED_BITS, X86_CR0_CD, X86_CR0_ET, X86_CR0_NW,
};
use crate::svm::SvmState;
use control_area::{
    CleanBits, ControlArea, General1Intercepts, General2Intercepts, NP_ENABLE_NESTED_PAGING,
    TLB_FLUSH_ALL, TLB_FLUSH_GUEST,
};
use save_area::{SaveArea, VmcbSegment};

/// Startup pseudo-vector used to reset the bootstrap processor. Real SIPI
/// vectors are 8 bits, so this value cannot collide.
pub const BSP_PSEUDO_SIPI: u32 = 0x100;

#[repr(C, align(4096))]
pub struct Vmcb {
    pub control_area: ControlArea,
    pub save_area: SaveArea,
    pub padding: [u8; 0x1000 - 0x400 - 0x298],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), 0x1000);

impl Vmcb {
    /// Builds the VMCB so that the first VMRUN continues the root OS
    /// exactly where it entered the hypervisor.
    pub fn setup(
        &mut self,
        host: &HostState,
        cell: &Cell,
        state: &SvmState,
        mem: &dyn PhysMem,
    ) {
        unsafe { core::ptr::write_bytes(self as *mut Self, 0, 1) };

        let save = &mut self.save_area;
        save.cr0 = host.cr0 & SVM_CR0_ALLOWED_BITS;
        save.cr3 = host.cr3;
        save.cr4 = host.cr4;

        save.cs = host.cs;
        save.ds = host.ds;
        save.es = host.es;
        save.fs = host.fs;
        save.gs = host.gs;
        save.tr = host.tss;
        save.gdtr = VmcbSegment::new(0, 0, host.gdtr.limit, host.gdtr.base);
        save.idtr = VmcbSegment::new(0, 0, host.idtr.limit, host.idtr.base);

        save.cpl = 0;
        save.efer = host.efer | EFER_SVME;
        save.rip = host.ip;
        // Skip the entry register snapshot and return address still on the
        // root OS stack; activation reloads those registers directly.
        save.rsp = host.sp + (NUM_ENTRY_REGS as u64 + 1) * 8;
        save.rflags = RFLAGS_RESET_VALUE;

        save.star = host.star;
        save.lstar = host.lstar;
        save.cstar = host.cstar;
        save.sfmask = host.sfmask;
        save.kernel_gs_base = host.kernel_gs_base;
        save.sysenter_cs = host.sysenter_cs;
        save.sysenter_esp = host.sysenter_esp;
        save.sysenter_eip = host.sysenter_eip;
        save.g_pat = host.pat;

        save.dr6 = DR6_RESET_VALUE;
        save.dr7 = DR7_RESET_VALUE;

        let control = &mut self.control_area;
        control.general1_intercepts = General1Intercepts::NMI
            | General1Intercepts::CR0_SEL_WRITE
            | General1Intercepts::IOIO_PROT
            | General1Intercepts::MSR_PROT
            | General1Intercepts::SHUTDOWN_EVT;
        control.general2_intercepts = General2Intercepts::VMRUN
            | General2Intercepts::VMMCALL
            | General2Intercepts::XSETBV;

        control.msrpm_base_pa = state.msrpm_pa(mem);
        control.np_enable = NP_ENABLE_NESTED_PAGING;
        control.guest_asid = 1;
        control.clean_bits = CleanBits::empty();

        self.set_cell_config(cell);
    }

    /// Puts the guest-visible state into its power-on shape. A SIPI vector
    /// of [`BSP_PSEUDO_SIPI`] selects the architectural reset vector, a
    /// real vector `v` starts the core at `v << 12` in real mode.
    pub fn reset(&mut self, sipi_vector: u32, cell: &Cell, flush_by_asid: bool) {
        let save = &mut self.save_area;

        save.cr0 = X86_CR0_NW | X86_CR0_CD | X86_CR0_ET;
        save.cr2 = 0;
        save.cr3 = 0;
        save.cr4 = 0;

        save.rflags = RFLAGS_RESET_VALUE;
        save.efer = EFER_SVME;
        save.rsp = 0;
        save.rax = 0;

        if sipi_vector == BSP_PSEUDO_SIPI {
            save.rip = 0xfff0;
            save.cs = VmcbSegment::new(0xf000, 0x009b, 0xffff, 0xf0000);
        } else {
            save.rip = 0;
            save.cs = VmcbSegment::new(
                (sipi_vector << 8) as u16,
                0x009b,
                0xffff,
                (sipi_vector as u64) << 12,
            );
        }

        let data_seg = VmcbSegment::new(0, 0x0093, 0xffff, 0);
        save.ds = data_seg;
        save.es = data_seg;
        save.fs = data_seg;
        save.gs = data_seg;
        save.ss = data_seg;
        save.tr = VmcbSegment::new(0, 0x008b, 0xffff, 0);
        save.ldtr = VmcbSegment::new(0, 0x0082, 0xffff, 0);
        save.gdtr = VmcbSegment::new(0, 0, 0xffff, 0);
        save.idtr = VmcbSegment::new(0, 0, 0xffff, 0);

        save.cpl = 0;
        save.dr7 = DR7_RESET_VALUE;
        save.g_pat = PAT_RESET_VALUE;

        save.star = 0;
        save.lstar = 0;
        save.cstar = 0;
        save.sfmask = 0;
        save.kernel_gs_base = 0;
        save.sysenter_cs = 0;
        save.sysenter_esp = 0;
        save.sysenter_eip = 0;

        self.set_cell_config(cell);
        // Hardware may have cached any guest-state group.
        self.control_area.clean_bits = CleanBits::empty();
        self.tlb_flush(flush_by_asid);
    }

    /// Points the VMCB at the cell's address-space configuration.
    pub fn set_cell_config(&mut self, cell: &Cell) {
        self.control_area.iopm_base_pa = cell.iopm_pa;
        self.control_area.n_cr3 = cell.npt_root_pa();
        self.control_area
            .clean_bits
            .remove(CleanBits::IOMSRPM | CleanBits::NP);
    }

    /// Advances the guest past the intercepted instruction.
    pub fn skip_instruction(&mut self, len: u64) {
        self.save_area.rip += len;
    }

    /// Requests a TLB flush on the next VMRUN. Scoped to the guest ASID
    /// when the part supports it, a full flush otherwise.
    pub fn tlb_flush(&mut self, flush_by_asid: bool) {
        self.control_area.tlb_control = if flush_by_asid {
            TLB_FLUSH_GUEST
        } else {
            TLB_FLUSH_ALL
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_cell, TestMem};

    fn vmcb_bytes(vmcb: &Vmcb) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(vmcb as *const Vmcb as *const u8, core::mem::size_of::<Vmcb>())
        }
    }

    fn zeroed_vmcb() -> alloc::boxed::Box<Vmcb> {
        unsafe {
            let raw = alloc::alloc::alloc_zeroed(core::alloc::Layout::new::<Vmcb>());
            assert!(!raw.is_null());
            alloc::boxed::Box::from_raw(raw as *mut Vmcb)
        }
    }

    #[test]
    fn bsp_reset_starts_at_reset_vector() {
        let mem = TestMem::new();
        let cell = test_cell(&mem);
        let mut vmcb = zeroed_vmcb();

        vmcb.reset(BSP_PSEUDO_SIPI, &cell, false);

        assert_eq!(vmcb.save_area.rip, 0xfff0);
        assert_eq!(vmcb.save_area.cs.selector, 0xf000);
        assert_eq!(vmcb.save_area.cs.base, 0xf0000);
        assert_eq!(vmcb.save_area.cr0, X86_CR0_NW | X86_CR0_CD | X86_CR0_ET);
        assert_eq!(vmcb.save_area.efer, EFER_SVME);
        assert_eq!(vmcb.save_area.g_pat, PAT_RESET_VALUE);
    }

    #[test]
    fn sipi_reset_maps_vector_to_segment() {
        let mem = TestMem::new();
        let cell = test_cell(&mem);
        let mut vmcb = zeroed_vmcb();

        vmcb.reset(0x9a, &cell, false);

        assert_eq!(vmcb.save_area.rip, 0);
        assert_eq!(vmcb.save_area.cs.selector, 0x9a00);
        assert_eq!(vmcb.save_area.cs.base, 0x9a000);
        assert_eq!(vmcb.save_area.cs.limit, 0xffff);
    }

    #[test]
    fn reset_is_idempotent() {
        let mem = TestMem::new();
        let cell = test_cell(&mem);
        let mut a = zeroed_vmcb();
        let mut b = zeroed_vmcb();

        a.reset(BSP_PSEUDO_SIPI, &cell, true);
        b.reset(BSP_PSEUDO_SIPI, &cell, true);
        b.reset(BSP_PSEUDO_SIPI, &cell, true);

        assert_eq!(vmcb_bytes(&a), vmcb_bytes(&b));
    }

    #[test]
    fn cell_config_tracks_cell_tables() {
        let mem = TestMem::new();
        let cell = test_cell(&mem);
        let mut vmcb = zeroed_vmcb();
        vmcb.control_area.clean_bits = CleanBits::all();

        vmcb.set_cell_config(&cell);

        assert_eq!(vmcb.control_area.n_cr3, cell.npt_root_pa());
        assert_eq!(vmcb.control_area.iopm_base_pa, cell.iopm_pa);
        assert!(!vmcb.control_area.clean_bits.contains(CleanBits::NP));
        assert!(!vmcb.control_area.clean_bits.contains(CleanBits::IOMSRPM));
        assert!(vmcb.control_area.clean_bits.contains(CleanBits::SEG));
    }

    #[test]
    fn tlb_flush_scope_follows_capability() {
        let mut vmcb = zeroed_vmcb();

        vmcb.tlb_flush(true);
        assert_eq!(vmcb.control_area.tlb_control, TLB_FLUSH_GUEST);

        vmcb.tlb_flush(false);
        assert_eq!(vmcb.control_area.tlb_control, TLB_FLUSH_ALL);
    }
}
