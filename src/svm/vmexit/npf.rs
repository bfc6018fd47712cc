//! Nested page faults: APIC emulation traffic and generic MMIO.

use crate::percpu::{CpuStat, PerCpu};
use crate::platform::{PfIntercept, Platform};
use crate::svm::decode::GuestPagingMode;
use crate::svm::npt::PAGE_SIZE;
use crate::svm::vmcb::control_area::NptExitInfo;
use crate::svm::{SvmState, XAPIC_BASE};

pub(super) fn handle(cpu: &mut PerCpu, platform: &mut dyn Platform, state: &SvmState) -> bool {
    let exitinfo = NptExitInfo::from_bits_truncate(cpu.vmcb.control_area.exitinfo1);
    let fault_addr = cpu.vmcb.control_area.exitinfo2;

    // A present-and-permitted fault on the xAPIC page is the write trap of
    // the read-only APIC mapping. Everything else is ordinary MMIO.
    let apic_trap = NptExitInfo::PRESENT | NptExitInfo::WRITE | NptExitInfo::USER;
    if exitinfo.contains(apic_trap)
        && (XAPIC_BASE..XAPIC_BASE + PAGE_SIZE).contains(&fault_addr)
        && state.avic_page_pa.is_none()
    {
        cpu.stats.bump(CpuStat::Xapic);
        if handle_apic_access(cpu, platform) {
            return true;
        }
    } else {
        cpu.stats.bump(CpuStat::Mmio);
        let pf = PfIntercept {
            phys_addr: fault_addr,
            is_write: exitinfo.contains(NptExitInfo::WRITE),
        };
        if platform.handle_pt_violation(&mut cpu.stack.guest_regs, &pf) {
            return true;
        }
    }

    log::error!(
        "FATAL: Unhandled Nested Page Fault for {:#x}, error code is {:#x}",
        fault_addr,
        cpu.vmcb.control_area.exitinfo1 & 0xf
    );
    false
}

fn handle_apic_access(cpu: &mut PerCpu, platform: &mut dyn Platform) -> bool {
    let is_write = NptExitInfo::from_bits_truncate(cpu.vmcb.control_area.exitinfo1)
        .contains(NptExitInfo::WRITE);
    let offset = cpu.vmcb.control_area.exitinfo2 - XAPIC_BASE;

    // APIC registers are 16-byte aligned; anything else is not a register
    // access.
    if offset & 0xf != 0 {
        log::error!(
            "FATAL: Unhandled APIC access, offset {}, is_write: {}",
            offset,
            is_write
        );
        return false;
    }

    let pg_mode = match GuestPagingMode::from_save_area(&cpu.vmcb.save_area) {
        Some(mode) => mode,
        None => {
            log::error!("FATAL: Unsupported guest paging mode");
            return false;
        }
    };

    let pc = cpu.vmcb.save_area.rip;
    let reg = (offset >> 4) as u32;
    match platform.apic_mmio_access(&mut cpu.stack.guest_regs, pc, pg_mode, reg, is_write) {
        Some(inst_len) => {
            cpu.vmcb.skip_instruction(inst_len);
            true
        }
        None => {
            log::error!(
                "FATAL: Unhandled APIC access, offset {}, is_write: {}",
                offset,
                is_write
            );
            false
        }
    }
}
