//! Per-core virtualization context.
//!
//! Exactly one [`PerCpu`] exists per physical core. It owns the core's VMCB,
//! the host stack the exit handler runs on, the saved root-OS ("host")
//! architectural state and the per-core statistics counters. The layout of
//! the leading fields is part of the contract with the transition assembly
//! in [`crate::svm::vmlaunch`].

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::platform::{PhysMem, Platform};
use crate::svm::features::SvmFeatures;
use crate::svm::msr::{
    EFER_SVME, MSR_EFER, MSR_VM_HSAVE_PA, X86_CR0_RESERVED,
};
use crate::svm::vmcb::save_area::VmcbSegment;
use crate::svm::vmcb::Vmcb;
use crate::svm::SvmState;
use alloc::boxed::Box;
use bitfield::bitfield;
use x86::msr::{rdmsr, wrmsr};

/// Callee-saved registers restored on guest activation: r15, r14, r13, r12,
/// rbx, rbp, in that order.
pub const NUM_ENTRY_REGS: usize = 6;

/// Guest general-purpose register file, in the order the exit assembly
/// spills it (r15 at the lowest address).
///
/// `unused_rsp` is a placeholder: the guest stack pointer lives in the VMCB
/// save area and is never spilled here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub unused_rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);

impl GuestRegisters {
    /// Register selected by an x86 GPR encoding. Index 4 (rsp) is not kept
    /// in this file; callers must source it from the VMCB.
    pub fn gpr(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.unused_rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Descriptor-table register (GDTR/IDTR) as captured from the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescTableReg {
    pub base: u64,
    pub limit: u32,
}

/// Architectural state of the root-OS context this core virtualizes.
///
/// Filled once before activation (partly captured from hardware, partly by
/// the bring-up orchestrator: `ip`, `sp` and `saved_regs` describe the point
/// the root OS resumes at) and updated from the VMCB on deactivation.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,

    pub cs: VmcbSegment,
    pub ds: VmcbSegment,
    pub es: VmcbSegment,
    pub fs: VmcbSegment,
    pub gs: VmcbSegment,
    pub tss: VmcbSegment,
    pub gdtr: DescTableReg,
    pub idtr: DescTableReg,

    /// Continuation point: the guest resumes as if returning from the call
    /// that entered the hypervisor.
    pub ip: u64,
    pub sp: u64,

    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub pat: u64,

    /// Callee-saved snapshot restored by the activation assembly.
    pub saved_regs: [u64; NUM_ENTRY_REGS],
}

bitfield! {
    /// Legacy GDT descriptor, for folding into the packed SVM attribute
    /// format (descriptor bytes 5 and the high nibble of byte 6).
    struct SegmentDescriptor(u64);
    u64;
    limit_low, _: 15, 0;
    base_low, _: 39, 16;
    attr_low, _: 47, 40;
    limit_high, _: 51, 48;
    attr_high, _: 55, 52;
    base_high, _: 63, 56;
}

/// Reads a segment descriptor out of the GDT. System descriptors (TSS) are
/// 16 bytes and carry the upper base half in the second quadword.
unsafe fn segment_from_gdt(gdt_base: u64, selector: u16, is_system: bool) -> VmcbSegment {
    if selector & !0x7 == 0 {
        return VmcbSegment {
            selector,
            ..VmcbSegment::default()
        };
    }

    let desc_ptr = (gdt_base + (selector & !0x7) as u64) as *const u64;
    let desc = SegmentDescriptor(desc_ptr.read());

    let attrib = (desc.attr_low() | (desc.attr_high() << 8)) as u16;
    let mut limit = (desc.limit_low() | (desc.limit_high() << 16)) as u32;
    if desc.attr_high() & 0x8 != 0 {
        // granularity bit: limit counts 4 KiB units
        limit = (limit << 12) | 0xfff;
    }
    let mut base = desc.base_low() | (desc.base_high() << 24);
    if is_system {
        base |= (desc_ptr.add(1).read() & 0xffff_ffff) << 32;
    }

    VmcbSegment {
        selector,
        attrib,
        limit,
        base,
    }
}

impl HostState {
    /// Snapshots the architectural state of the running context. `ip`, `sp`
    /// and `saved_regs` are left alone; the bring-up path fills them from
    /// its entry frame.
    ///
    /// # Safety
    ///
    /// Reads control registers, MSRs and descriptor tables; CPL0 only.
    pub unsafe fn capture(&mut self) {
        use crate::svm::msr::{
            MSR_CSTAR, MSR_FS_BASE, MSR_GS_BASE, MSR_IA32_PAT, MSR_KERNGS_BASE, MSR_LSTAR,
            MSR_SFMASK, MSR_STAR, MSR_SYSENTER_CS, MSR_SYSENTER_EIP, MSR_SYSENTER_ESP,
        };
        use core::arch::asm;

        asm!("mov {}, cr0", out(reg) self.cr0, options(nomem, nostack));
        asm!("mov {}, cr3", out(reg) self.cr3, options(nomem, nostack));
        asm!("mov {}, cr4", out(reg) self.cr4, options(nomem, nostack));
        self.efer = rdmsr(MSR_EFER);

        let gdtr = x86_64::instructions::tables::sgdt();
        self.gdtr = DescTableReg {
            base: gdtr.base.as_u64(),
            limit: gdtr.limit as u32,
        };
        let idtr = x86_64::instructions::tables::sidt();
        self.idtr = DescTableReg {
            base: idtr.base.as_u64(),
            limit: idtr.limit as u32,
        };

        let mut sel: u16;
        asm!("mov {0:x}, cs", out(reg) sel, options(nomem, nostack));
        self.cs = segment_from_gdt(self.gdtr.base, sel, false);
        asm!("mov {0:x}, ds", out(reg) sel, options(nomem, nostack));
        self.ds = segment_from_gdt(self.gdtr.base, sel, false);
        asm!("mov {0:x}, es", out(reg) sel, options(nomem, nostack));
        self.es = segment_from_gdt(self.gdtr.base, sel, false);
        asm!("mov {0:x}, fs", out(reg) sel, options(nomem, nostack));
        self.fs = segment_from_gdt(self.gdtr.base, sel, false);
        asm!("mov {0:x}, gs", out(reg) sel, options(nomem, nostack));
        self.gs = segment_from_gdt(self.gdtr.base, sel, false);
        asm!("str {0:x}", out(reg) sel, options(nomem, nostack));
        self.tss = segment_from_gdt(self.gdtr.base, sel, true);

        // The descriptor bases of fs/gs are stale in long mode; the MSRs
        // hold the live values.
        self.fs.base = rdmsr(MSR_FS_BASE);
        self.gs.base = rdmsr(MSR_GS_BASE);

        self.sysenter_cs = rdmsr(MSR_SYSENTER_CS);
        self.sysenter_esp = rdmsr(MSR_SYSENTER_ESP);
        self.sysenter_eip = rdmsr(MSR_SYSENTER_EIP);
        self.star = rdmsr(MSR_STAR);
        self.lstar = rdmsr(MSR_LSTAR);
        self.cstar = rdmsr(MSR_CSTAR);
        self.sfmask = rdmsr(MSR_SFMASK);
        self.kernel_gs_base = rdmsr(MSR_KERNGS_BASE);
        self.pat = rdmsr(MSR_IA32_PAT);
    }
}

/// Per-CPU statistics exported to the management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStat {
    VmexitsTotal = 0,
    Management,
    Hypercall,
    Mmio,
    Pio,
    Xapic,
    Cr,
    Msr,
    Cpuid,
    Xsetbv,
}

pub const NUM_CPU_STATS: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuStats([u64; NUM_CPU_STATS]);

impl CpuStats {
    pub fn bump(&mut self, stat: CpuStat) {
        self.0[stat as usize] += 1;
    }

    pub fn get(&self, stat: CpuStat) -> u64 {
        self.0[stat as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    Running = 0,
    Failed,
}

/// Stack the exit handler runs on. The trailing frame is what the host
/// stack pointer is parked on across VMRUN; the transition assembly indexes
/// it relative to `rsp`, so its layout is pinned.
#[repr(C)]
pub struct VmrunFrame {
    /// `[rsp]` at VMRUN: physical address of this core's VMCB.
    pub guest_vmcb_pa: u64,
    /// `[rsp + 8]`: pointer back to the owning [`PerCpu`].
    pub per_cpu: u64,
    pub padding: [u64; 2],
}
const_assert_eq!(core::mem::size_of::<VmrunFrame>(), 32);

pub const STACK_SIZE: usize = 0x4000;

#[repr(C, align(4096))]
pub struct HostStack {
    pub contents: [u8; STACK_SIZE
        - core::mem::size_of::<GuestRegisters>()
        - core::mem::size_of::<VmrunFrame>()],
    /// The exit stub's register spills land exactly here; the stack pointer
    /// sits at `frame` across VMRUN.
    pub guest_regs: GuestRegisters,
    pub frame: VmrunFrame,
}
const_assert_eq!(core::mem::size_of::<HostStack>(), STACK_SIZE);

#[repr(C, align(4096))]
pub struct HostSaveArea([u8; 4096]);

/// Pointers the exit entry needs to rebuild its calling context. Installed
/// by `activate_vmm`, torn down never: the core stays in its exit loop until
/// parked or shut down.
#[derive(Default)]
pub(crate) struct RunContext {
    pub(crate) cell: Option<core::ptr::NonNull<Cell>>,
    pub(crate) platform: Option<core::ptr::NonNull<dyn Platform>>,
    pub(crate) mem: Option<core::ptr::NonNull<dyn PhysMem>>,
    pub(crate) state: Option<&'static SvmState>,
}

#[repr(C, align(4096))]
pub struct PerCpu {
    /// Must stay first; the activation assembly derives the host stack top
    /// from the struct base.
    pub stack: HostStack,
    pub vmcb: Vmcb,
    pub host_save_area: HostSaveArea,

    pub host: HostState,
    pub stats: CpuStats,
    pub features: SvmFeatures,
    pub cpu_id: u32,
    pub state: CpuState,
    pub svm_enabled: bool,
    pub(crate) run_ctx: RunContext,
}

impl PerCpu {
    /// Heap-allocates a zeroed context. The structure is far too large for
    /// the stack.
    pub fn new(cpu_id: u32) -> Result<Box<Self>> {
        let layout = core::alloc::Layout::new::<Self>();
        // Zeroed is a valid value for every field: empty stats, cleared
        // VMCB, `Running` state, no run context.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut Self;
        if raw.is_null() {
            return Err(Error::OutOfMemory);
        }
        let mut cpu = unsafe { Box::from_raw(raw) };
        cpu.cpu_id = cpu_id;
        Ok(cpu)
    }

    /// Enables SVM on this core and builds the VMCB from the captured host
    /// state, so that the switch into guest mode is observationally
    /// transparent to the root OS.
    pub fn vcpu_init(
        &mut self,
        cell: &mut Cell,
        state: &'static SvmState,
        mem: &dyn PhysMem,
    ) -> Result<()> {
        let efer = unsafe { rdmsr(MSR_EFER) };
        if efer & EFER_SVME != 0 {
            return Err(Error::AlreadyEnabled);
        }
        unsafe { wrmsr(MSR_EFER, efer | EFER_SVME) };
        self.svm_enabled = true;
        self.features = state.features;

        // APM 3.1.1 asks software to preserve reserved CR0 bits. The root
        // OS setting any we do not know about would make the transition
        // non-transparent, so bail out instead of guessing.
        if self.host.cr0 & X86_CR0_RESERVED != 0 {
            return Err(Error::ReservedCr0Bits);
        }

        self.vmcb.setup(&self.host, cell, state, mem);

        crate::svm::vmlaunch::set_host_control_regs();
        unsafe { wrmsr(MSR_VM_HSAVE_PA, mem.phys(self.host_save_area.0.as_ptr())) };

        Ok(())
    }

    /// Leaves SVM operation: sets GIF so pending events can be delivered
    /// again, clears EFER.SVME and unbinds the host save area.
    pub fn vcpu_exit(&mut self) {
        if !self.svm_enabled {
            return;
        }
        self.svm_enabled = false;

        crate::svm::vmlaunch::set_gif();
        unsafe {
            let efer = rdmsr(MSR_EFER);
            wrmsr(MSR_EFER, efer & !EFER_SVME);
            wrmsr(MSR_VM_HSAVE_PA, 0);
        }
    }

    pub(crate) fn host_stack_top(&mut self) -> u64 {
        &mut self.stack.frame as *mut VmrunFrame as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_encoding_matches_push_order() {
        let mut regs = GuestRegisters::default();
        regs.rax = 1;
        regs.rcx = 2;
        regs.rbx = 4;
        regs.rbp = 6;
        regs.r8 = 9;
        regs.r15 = 16;

        assert_eq!(regs.gpr(0), 1);
        assert_eq!(regs.gpr(1), 2);
        assert_eq!(regs.gpr(3), 4);
        assert_eq!(regs.gpr(5), 6);
        assert_eq!(regs.gpr(8), 9);
        assert_eq!(regs.gpr(15), 16);
    }

    #[test]
    fn stats_accumulate_per_category() {
        let mut stats = CpuStats::default();
        stats.bump(CpuStat::VmexitsTotal);
        stats.bump(CpuStat::VmexitsTotal);
        stats.bump(CpuStat::Msr);

        assert_eq!(stats.get(CpuStat::VmexitsTotal), 2);
        assert_eq!(stats.get(CpuStat::Msr), 1);
        assert_eq!(stats.get(CpuStat::Pio), 0);
    }
}
