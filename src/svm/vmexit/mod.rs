//! #VMEXIT dispatch.
//!
//! Every intercept lands in [`handle_exit`]. Handlers return whether the
//! exit was modeled; anything unhandled is fatal for the core, which gets
//! parked on the halt loop with its cell marked failed.

mod cr;
mod msr;
mod npf;

use crate::cell::{Cell, CellState};
use crate::percpu::{CpuStat, CpuState, PerCpu};
use crate::platform::{ExecutionState, GuestMemory, IoIntercept, PhysMem, Platform};
use crate::svm::msr::X86_XCR0_FP;
use crate::svm::vmcb::control_area::{CleanBits, ExitCode};
use crate::svm::vmcb::BSP_PSEUDO_SIPI;
use crate::svm::{vmlaunch, SvmState};

const INST_LEN_XSETBV: u64 = 3;

/// Reads guest-physical memory through the cell's nested page table. Only
/// pages the cell can read are visible, so a malicious guest cannot steer
/// the instruction parser outside its own memory.
pub(crate) struct CellGuestMem<'a> {
    cell: &'a Cell,
    mem: &'a dyn PhysMem,
}

impl<'a> CellGuestMem<'a> {
    pub(crate) fn new(cell: &'a Cell, mem: &'a dyn PhysMem) -> Self {
        Self { cell, mem }
    }
}

impl GuestMemory for CellGuestMem<'_> {
    fn read(&self, gpa: u64, buf: &mut [u8]) -> bool {
        for (i, byte) in buf.iter_mut().enumerate() {
            let (hpa, flags) = match self.cell.translate(self.mem, gpa + i as u64) {
                Some(mapping) => mapping,
                None => return false,
            };
            if !flags.contains(crate::svm::npt::MemFlags::READ) {
                return false;
            }
            *byte = unsafe { *self.mem.virt(hpa) };
        }
        true
    }
}

/// Dispatches one #VMEXIT and prepares the VMCB for the next VMRUN.
pub fn handle_exit(
    cpu: &mut PerCpu,
    cell: &mut Cell,
    state: &SvmState,
    mem: &dyn PhysMem,
    platform: &mut dyn Platform,
) {
    cpu.stats.bump(CpuStat::VmexitsTotal);

    // All guest state is marked unmodified; individual handlers must clear
    // the bits they touch.
    cpu.vmcb.control_area.clean_bits = CleanBits::all();
    // The guest rax lives in the VMCB; mirror it into the register file for
    // the handlers and write it back below.
    cpu.stack.guest_regs.rax = cpu.vmcb.save_area.rax;

    let raw_exitcode = cpu.vmcb.control_area.exitcode;
    let handled = match ExitCode::from_raw(raw_exitcode) {
        Some(ExitCode::Invalid) => {
            log::error!("FATAL: VM-entry failure");
            false
        }
        Some(ExitCode::Nmi) => {
            cpu.stats.bump(CpuStat::Management);
            // Briefly open GIF to consume the pending NMI ourselves.
            vmlaunch::nmi_window();
            if let Some(sipi_vector) = platform.handle_events(cpu.cpu_id) {
                log::info!("CPU {} received SIPI, vector {:#x}", cpu.cpu_id, sipi_vector);
                cpu.vmcb.reset(sipi_vector, cell, state.features.flush_by_asid);
                cpu.stack.guest_regs.clear();
            }
            platform.check_pending_iommu_faults(cpu.cpu_id);
            true
        }
        Some(ExitCode::Cpuid) => {
            // CPUID is not intercepted; this only fires if a config enabled
            // the intercept, in which case pass the leaf through untouched.
            cpu.stats.bump(CpuStat::Cpuid);
            true
        }
        Some(ExitCode::Vmmcall) => {
            cpu.stats.bump(CpuStat::Hypercall);
            let exec_state = ExecutionState {
                efer: cpu.vmcb.save_area.efer,
                rflags: cpu.vmcb.save_area.rflags,
                cs: cpu.vmcb.save_area.cs.selector,
                rip: cpu.vmcb.save_area.rip,
            };
            platform.handle_hypercall(&mut cpu.stack.guest_regs, &exec_state);
            true
        }
        Some(ExitCode::Cr0SelWrite) => {
            cpu.stats.bump(CpuStat::Cr);
            cr::handle(cpu, cell, state, mem)
        }
        Some(ExitCode::Msr) => {
            cpu.stats.bump(CpuStat::Msr);
            msr::handle(cpu, state, platform)
        }
        Some(ExitCode::Npf) => npf::handle(cpu, platform, state),
        Some(ExitCode::Xsetbv) => {
            cpu.stats.bump(CpuStat::Xsetbv);
            handle_xsetbv(cpu)
        }
        Some(ExitCode::Ioio) => {
            cpu.stats.bump(CpuStat::Pio);
            handle_io(cpu, platform)
        }
        None => {
            log::error!(
                "FATAL: Unexpected #VMEXIT, exitcode {:#x}, exitinfo1 {:#x} exitinfo2 {:#x}",
                raw_exitcode,
                cpu.vmcb.control_area.exitinfo1,
                cpu.vmcb.control_area.exitinfo2
            );
            false
        }
    };

    if handled {
        cpu.vmcb.save_area.rax = cpu.stack.guest_regs.rax;
        return;
    }

    dump_guest_state(cpu);
    fail_cpu(cpu, cell, state);
}

fn handle_xsetbv(cpu: &mut PerCpu) -> bool {
    let regs = &cpu.stack.guest_regs;
    if regs.rax & X86_XCR0_FP != 0
        && regs.rax & !vmlaunch::host_xcr0_features() == 0
        && regs.rcx == 0
        && regs.rdx == 0
    {
        let value = regs.rax & 0xffff_ffff;
        cpu.vmcb.skip_instruction(INST_LEN_XSETBV);
        unsafe { vmlaunch::execute_xsetbv(0, value) };
        true
    } else {
        log::error!(
            "FATAL: Invalid xsetbv parameters: xcr[{}] = {:#x}:{:#x}",
            regs.rcx,
            regs.rdx,
            regs.rax
        );
        false
    }
}

fn handle_io(cpu: &mut PerCpu, platform: &mut dyn Platform) -> bool {
    // EXITINFO1 layout per APM 15.10.2; EXITINFO2 holds the next rip.
    let exitinfo = cpu.vmcb.control_area.exitinfo1;
    let io = IoIntercept {
        port: ((exitinfo >> 16) & 0xffff) as u16,
        size: ((exitinfo >> 4) & 0x7) as u8,
        is_in: exitinfo & 0x1 != 0,
        inst_len: cpu.vmcb.control_area.exitinfo2 - cpu.vmcb.save_area.rip,
        rep_or_str: exitinfo & 0x0c != 0,
    };
    if platform.handle_io_access(&mut cpu.stack.guest_regs, &io) {
        cpu.vmcb.skip_instruction(io.inst_len);
        true
    } else {
        false
    }
}

fn dump_guest_state(cpu: &PerCpu) {
    let save = &cpu.vmcb.save_area;
    let regs = &cpu.stack.guest_regs;
    log::error!(
        "RIP: {:#x} RSP: {:#x} FLAGS: {:#x}",
        save.rip,
        save.rsp,
        save.rflags
    );
    log::error!(
        "RAX: {:#x} RBX: {:#x} RCX: {:#x}",
        regs.rax,
        regs.rbx,
        regs.rcx
    );
    log::error!(
        "RDX: {:#x} RSI: {:#x} RDI: {:#x}",
        regs.rdx,
        regs.rsi,
        regs.rdi
    );
    log::error!(
        "CS: {:#x} BASE: {:#x} AR-BYTES: {:#x} EFER.LMA {}",
        save.cs.selector,
        save.cs.base,
        save.cs.attrib,
        (save.efer & crate::svm::msr::EFER_LMA) != 0
    );
    log::error!(
        "CR0: {:#x} CR3: {:#x} CR4: {:#x}",
        save.cr0,
        save.cr3,
        save.cr4
    );
    log::error!("EFER: {:#x}", save.efer);
}

/// Parks the CPU on the shared halt loop. The guest keeps running VMRUN
/// iterations, but only ever executes cli/hlt out of the parking page.
pub fn park_cpu(cpu: &mut PerCpu, cell: &Cell, state: &SvmState) {
    cpu.vmcb.reset(BSP_PSEUDO_SIPI, cell, state.features.flush_by_asid);
    // Clean bits were already cleared by the reset, so the switched N_CR3
    // is picked up.
    cpu.vmcb.control_area.n_cr3 = state.parking_root_pa;
}

/// Fatal-exit path: record the failure and park.
fn fail_cpu(cpu: &mut PerCpu, cell: &mut Cell, state: &SvmState) {
    cpu.state = CpuState::Failed;
    cell.cpus_failed.add(cpu.cpu_id);
    cell.state = CellState::Failed;
    park_cpu(cpu, cell, state);
    cpu.stack.guest_regs.clear();
}
