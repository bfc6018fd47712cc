//! Intercepted MSR accesses.
//!
//! The MSR permission map keeps these rare: the x2APIC window while the
//! APIC is emulated, EFER writes, and the minimal MTRR emulation.

use crate::percpu::PerCpu;
use crate::platform::Platform;
use crate::svm::msr::{
    EFER_LME, EFER_NXE, EFER_SVME, MSR_EFER, MSR_MTRR_DEFTYPE, MSR_X2APIC_BASE, MSR_X2APIC_END,
    PAT_RESET_VALUE,
};
use crate::svm::vmcb::control_area::CleanBits;
use crate::svm::{vmlaunch, SvmState};

const INST_LEN_RDMSR_WRMSR: u64 = 2;

pub(super) fn handle(cpu: &mut PerCpu, state: &SvmState, platform: &mut dyn Platform) -> bool {
    if cpu.vmcb.control_area.exitinfo1 == 0 {
        handle_read(cpu, platform)
    } else {
        handle_write(cpu, state, platform)
    }
}

fn is_x2apic(msr: u32) -> bool {
    (MSR_X2APIC_BASE..=MSR_X2APIC_END).contains(&msr)
}

fn handle_read(cpu: &mut PerCpu, platform: &mut dyn Platform) -> bool {
    let msr = cpu.stack.guest_regs.rcx as u32;
    if is_x2apic(msr) {
        cpu.vmcb.skip_instruction(INST_LEN_RDMSR_WRMSR);
        platform.x2apic_handle_read(&mut cpu.stack.guest_regs);
        true
    } else {
        log::error!("FATAL: Unhandled MSR read: {:#x}", msr);
        false
    }
}

fn handle_write(cpu: &mut PerCpu, state: &SvmState, platform: &mut dyn Platform) -> bool {
    let msr = cpu.stack.guest_regs.rcx as u32;
    let val = (cpu.stack.guest_regs.rax & 0xffff_ffff) | (cpu.stack.guest_regs.rdx << 32);

    let result = if is_x2apic(msr) {
        platform.x2apic_handle_write(&mut cpu.stack.guest_regs)
    } else if msr == MSR_EFER {
        // Never let a guest disable SVME, see APMv2, Sect. 3.1.7.
        let efer = val | EFER_SVME;
        // Flush TLB on LME/NXE change, see APMv2, Sect. 15.16.
        if (efer ^ cpu.vmcb.save_area.efer) & (EFER_LME | EFER_NXE) != 0 {
            cpu.vmcb.tlb_flush(state.features.flush_by_asid);
        }
        cpu.vmcb.save_area.efer = efer;
        cpu.vmcb.control_area.clean_bits.remove(CleanBits::CRX);
        true
    } else if msr == MSR_MTRR_DEFTYPE {
        // Quick and very incomplete MTRR emulation: only the enable bit is
        // modeled. Clearing it makes all NPT-mapped memory UC by zeroing
        // the host PAT (APMv2, Sect. 15.25.8); setting it restores the
        // default PAT, which may still differ from what the guest expects.
        if val & 0x800 != 0 {
            vmlaunch::write_host_pat(PAT_RESET_VALUE);
        } else {
            vmlaunch::write_host_pat(0);
        }
        true
    } else {
        log::error!("FATAL: Unhandled MSR write: {:#x}", msr);
        false
    };

    if result {
        cpu.vmcb.skip_instruction(INST_LEN_RDMSR_WRMSR);
    }
    result
}
