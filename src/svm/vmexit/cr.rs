//! Intercepted CR0 writes.
//!
//! Only selective CR0 writes trap (the CR0_SEL_WRITE intercept); the guest
//! otherwise owns its control registers under nested paging. The handler
//! exists to keep the prohibited CD/NW combinations out of the VMCB and to
//! complete long-mode entry.

use crate::cell::Cell;
use crate::percpu::PerCpu;
use crate::platform::PhysMem;
use crate::svm::decode;
use crate::svm::msr::{
    EFER_LMA, EFER_LME, SVM_CR0_ALLOWED_BITS, X86_CR0_CD, X86_CR0_NW, X86_CR0_PG, X86_CR0_WP,
};
use crate::svm::vmcb::control_area::CleanBits;
use crate::svm::vmexit::CellGuestMem;
use crate::svm::SvmState;

const INST_LEN_MOV_TO_CR: u64 = 3;

pub(super) fn handle(
    cpu: &mut PerCpu,
    cell: &Cell,
    state: &SvmState,
    mem: &dyn PhysMem,
) -> bool {
    let reg = if cpu.features.decode_assists {
        let exitinfo1 = cpu.vmcb.control_area.exitinfo1;
        if exitinfo1 & (1 << 63) == 0 {
            log::error!("FATAL: Unsupported CR access (LMSW or CLTS)");
            return false;
        }
        (exitinfo1 & 0x0f) as u8
    } else {
        let guest_mem = CellGuestMem::new(cell, mem);
        match decode::parse_mov_to_cr(
            &cpu.vmcb.save_area,
            cpu.vmcb.save_area.rip,
            0,
            cpu.vmcb.control_area.fetched_inst_bytes(),
            &guest_mem,
        ) {
            Some(gpr) => gpr,
            None => {
                log::error!("FATAL: Unable to parse MOV-to-CR instruction");
                return false;
            }
        }
    };

    let val = if reg == 4 {
        cpu.vmcb.save_area.rsp
    } else {
        cpu.stack.guest_regs.gpr(reg)
    };

    cpu.vmcb.skip_instruction(INST_LEN_MOV_TO_CR);

    // Flush TLB on PG/WP/CD/NW change, see APMv2, Sect. 15.16.
    let flush_bits = X86_CR0_PG | X86_CR0_WP | X86_CR0_CD | X86_CR0_NW;
    if (val ^ cpu.vmcb.save_area.cr0) & flush_bits != 0 {
        cpu.vmcb.tlb_flush(state.features.flush_by_asid);
    }

    cpu.vmcb.save_area.cr0 = val & SVM_CR0_ALLOWED_BITS;
    if val & X86_CR0_PG != 0 {
        update_efer(cpu, state);
    }
    cpu.vmcb.control_area.clean_bits.remove(CleanBits::CRX);

    true
}

/// Completes long-mode entry: with LME set and paging now on, the guest
/// expects LMA to appear.
fn update_efer(cpu: &mut PerCpu, state: &SvmState) {
    let efer = cpu.vmcb.save_area.efer;
    if efer & (EFER_LME | EFER_LMA) != EFER_LME {
        return;
    }

    // Flush TLB on LMA change, see APMv2, Sect. 15.16.
    cpu.vmcb.tlb_flush(state.features.flush_by_asid);
    cpu.vmcb.save_area.efer = efer | EFER_LMA;
    cpu.vmcb.control_area.clean_bits.remove(CleanBits::CRX);
}
