//! World switch: guest activation, the VMRUN/#VMEXIT loop and the unwind
//! back into the root OS on shutdown.
//!
//! The register spill area and the stack frame the loop runs on are laid
//! out by [`crate::percpu::HostStack`]; the offsets used below are pinned
//! by `const_assert`s there.

use crate::cell::Cell;
use crate::percpu::{HostState, PerCpu};
use crate::platform::{PhysMem, Platform};
use crate::svm::msr::{
    EFER_SVME, MSR_CSTAR, MSR_IA32_PAT, MSR_KERNGS_BASE, MSR_LSTAR, MSR_SFMASK, MSR_STAR,
    PAT_RESET_VALUE,
};
use crate::svm::vmcb::save_area::SaveArea;
use crate::svm::SvmState;
use core::ptr::NonNull;
use x86::msr::wrmsr;

#[cfg(not(test))]
core::arch::global_asm!(
    r#"
.global svm_activate
.global svm_unwind

// svm_activate(rdi: host stack frame, rsi: saved callee-saved regs) -> !
//
// Guest GPRs other than rax and rsp are carried through VMRUN unchanged,
// so the snapshot taken at hypervisor entry is reloaded first: the root OS
// continues as if the entry call had just returned.
svm_activate:
    clgi
    mov r15, [rsi]
    mov r14, [rsi + 0x08]
    mov r13, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov rbx, [rsi + 0x20]
    mov rbp, [rsi + 0x28]
    mov rsp, rdi
2:
    mov rax, [rsp]
    vmload rax
    vmrun rax
    vmsave rax

    // Spill the guest register file into HostStack::guest_regs. The rax
    // and rsp slots are placeholders; their values live in the VMCB.
    push rax
    push rcx
    push rdx
    push rbx
    push rax
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, [rsp + 0x88]
    call {exit_handler}

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    add rsp, 8
    pop rbx
    pop rdx
    pop rcx
    pop rax
    jmp 2b

// svm_unwind(rdi: root OS stack with the return ip pushed,
//            rsi: guest register spill area) -> !
//
// Restores the guest register file and returns into the root OS. The rax
// slot is skipped; rax reports success to the entry path's caller.
svm_unwind:
    mov rax, rdi
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    add rsp, 8
    pop rbx
    pop rdx
    pop rcx
    mov rsp, rax
    xor eax, eax
    ret
"#,
    exit_handler = sym exit_handler,
);

#[cfg(not(test))]
extern "C" {
    fn svm_activate(frame: u64, saved_regs: *const u64) -> !;
    fn svm_unwind(stack: u64, guest_regs: u64) -> !;
}

/// Rust landing point of every #VMEXIT. `cpu` is the pointer parked in the
/// stack frame; the run context was installed before the first VMRUN.
#[no_mangle]
unsafe extern "C" fn exit_handler(cpu: *mut PerCpu) {
    let cpu = &mut *cpu;
    let mut cell = cpu.run_ctx.cell.unwrap_unchecked();
    let mut platform = cpu.run_ctx.platform.unwrap_unchecked();
    let mem = cpu.run_ctx.mem.unwrap_unchecked();
    let state = cpu.run_ctx.state.unwrap_unchecked();

    crate::svm::vmexit::handle_exit(cpu, cell.as_mut(), state, mem.as_ref(), platform.as_mut());
}

/// Switches this core into guest mode. Does not return; from here on the
/// root OS runs as the cell's guest and the core lives in the exit loop.
pub fn activate_vmm(
    cpu: &mut PerCpu,
    cell: &mut Cell,
    state: &'static SvmState,
    platform: &mut dyn Platform,
    mem: &dyn PhysMem,
) -> ! {
    cpu.run_ctx.cell = Some(NonNull::from(cell));
    // SAFETY: only erases the trait-object lifetimes; the function diverges,
    // so the references outlive every use of the stored pointers.
    cpu.run_ctx.platform = Some(unsafe {
        core::mem::transmute::<NonNull<dyn Platform + '_>, NonNull<dyn Platform + 'static>>(
            NonNull::from(platform),
        )
    });
    cpu.run_ctx.mem = Some(unsafe {
        core::mem::transmute::<NonNull<dyn PhysMem + '_>, NonNull<dyn PhysMem + 'static>>(
            NonNull::from(mem),
        )
    });
    cpu.run_ctx.state = Some(state);

    cpu.stack.frame.guest_vmcb_pa = mem.phys(&cpu.vmcb as *const _ as *const u8);
    cpu.stack.frame.per_cpu = cpu as *mut PerCpu as u64;

    // The hypervisor does not use PAT, so pin it to the reset value. It is
    // still combined with the guest's G_PAT (APMv2, Sect. 15.25.8), which
    // may yield a memory type slightly different from what the root OS
    // expects.
    unsafe { wrmsr(MSR_IA32_PAT, PAT_RESET_VALUE) };

    unsafe { enter(cpu.host_stack_top(), cpu.host.saved_regs.as_ptr()) }
}

#[cfg(not(test))]
unsafe fn enter(frame: u64, saved_regs: *const u64) -> ! {
    svm_activate(frame, saved_regs)
}

#[cfg(test)]
unsafe fn enter(_frame: u64, _saved_regs: *const u64) -> ! {
    unreachable!("world switch in test build")
}

/// Copies the guest-visible register state back into the host mirror, so
/// the root OS resumes with everything it last programmed.
pub fn copy_state_to_host(save: &SaveArea, host: &mut HostState) {
    host.cr0 = save.cr0;
    host.cr3 = save.cr3;

    host.gdtr.base = save.gdtr.base;
    host.gdtr.limit = save.gdtr.limit;
    host.idtr.base = save.idtr.base;
    host.idtr.limit = save.idtr.limit;

    host.cs.selector = save.cs.selector;
    host.tss.selector = save.tr.selector;
    host.ds.selector = save.ds.selector;
    host.es.selector = save.es.selector;
    host.fs.selector = save.fs.selector;
    host.gs.selector = save.gs.selector;
    host.fs.base = save.fs.base;
    host.gs.base = save.gs.base;

    host.efer = save.efer & !EFER_SVME;

    host.sysenter_cs = save.sysenter_cs;
    host.sysenter_eip = save.sysenter_eip;
    host.sysenter_esp = save.sysenter_esp;
}

/// Leaves guest mode for good: restores the MSRs the guest last wrote,
/// copies its state back into the host mirror, disables SVM and unwinds
/// onto the guest stack as if the entry call returned zero.
///
/// # Safety
///
/// Must run on the exit-loop stack of `cpu`, with the guest stack mapped at
/// its identity address.
pub unsafe fn deactivate_vmm(cpu: &mut PerCpu) -> ! {
    let save = &cpu.vmcb.save_area;

    wrmsr(MSR_STAR, save.star);
    wrmsr(MSR_LSTAR, save.lstar);
    wrmsr(MSR_CSTAR, save.cstar);
    wrmsr(MSR_SFMASK, save.sfmask);
    wrmsr(MSR_KERNGS_BASE, save.kernel_gs_base);
    wrmsr(MSR_IA32_PAT, save.g_pat);

    let guest_sp = save.rsp - 8;
    let guest_ip = save.rip;

    copy_state_to_host(&cpu.vmcb.save_area, &mut cpu.host);
    cpu.vcpu_exit();

    // Return address for the final `ret`.
    *(guest_sp as *mut u64) = guest_ip;

    unwind(guest_sp, &cpu.stack.guest_regs as *const _ as u64)
}

#[cfg(not(test))]
unsafe fn unwind(stack: u64, guest_regs: u64) -> ! {
    svm_unwind(stack, guest_regs)
}

#[cfg(test)]
unsafe fn unwind(_stack: u64, _guest_regs: u64) -> ! {
    unreachable!("world switch in test build")
}

// Thin wrappers over the privileged instructions the dispatcher needs, so
// the exit handlers stay host-testable: under test they turn into no-ops
// with fixed capability answers.
cfg_if::cfg_if! {
    if #[cfg(not(test))] {
        /// Brings CR0 and CR4 into the well-defined states the hypervisor
        /// runs with.
        pub(crate) fn set_host_control_regs() {
            use crate::svm::msr::{
                X86_CR0_ET, X86_CR0_MP, X86_CR0_NE, X86_CR0_PE, X86_CR0_PG, X86_CR0_WP,
                X86_CR4_PAE,
            };
            const CR0_HOST_STATE: u64 =
                X86_CR0_PG | X86_CR0_WP | X86_CR0_NE | X86_CR0_ET | X86_CR0_MP | X86_CR0_PE;
            const CR4_HOST_STATE: u64 = X86_CR4_PAE;

            unsafe {
                core::arch::asm!("mov cr0, {}", in(reg) CR0_HOST_STATE, options(nostack));
                core::arch::asm!("mov cr4, {}", in(reg) CR4_HOST_STATE, options(nostack));
            }
        }

        /// Sets the global interrupt flag.
        pub(crate) fn set_gif() {
            unsafe { core::arch::asm!("stgi", options(nostack, nomem)) };
        }

        /// Opens a brief window for pending NMIs to be delivered to the
        /// hypervisor.
        pub(crate) fn nmi_window() {
            unsafe {
                core::arch::asm!("stgi", "clgi", options(nostack, nomem));
            }
        }

        /// XCR0 feature mask supported by this core, from CPUID leaf 0xd.
        pub(crate) fn host_xcr0_features() -> u64 {
            let res = x86::cpuid::cpuid!(0xd, 0);
            (res.eax as u64) | ((res.edx as u64) << 32)
        }

        pub(crate) unsafe fn execute_xsetbv(xcr: u32, value: u64) {
            core::arch::asm!(
                "xsetbv",
                in("ecx") xcr,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack, nomem),
            );
        }

        pub(crate) fn write_host_pat(value: u64) {
            unsafe { wrmsr(MSR_IA32_PAT, value) };
        }
    } else {
        pub(crate) fn set_host_control_regs() {}

        pub(crate) fn set_gif() {}

        pub(crate) fn nmi_window() {}

        pub(crate) fn host_xcr0_features() -> u64 {
            crate::svm::msr::X86_XCR0_FP | 0x6
        }

        pub(crate) unsafe fn execute_xsetbv(_xcr: u32, _value: u64) {}

        pub(crate) fn write_host_pat(_value: u64) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::percpu::NUM_ENTRY_REGS;
    use crate::svm::vmcb::save_area::VmcbSegment;

    #[test]
    fn state_copy_back_round_trips_through_save_area() {
        use crate::svm::msr::EFER_LMA;

        let mut save: SaveArea = unsafe { core::mem::zeroed() };
        save.cr0 = 0x8005_0033;
        save.cr3 = 0x1234_5000;
        save.efer = EFER_LMA | EFER_SVME;
        save.gdtr = VmcbSegment::new(0, 0, 0x7f, 0xffff_8000_0000_1000);
        save.idtr = VmcbSegment::new(0, 0, 0xfff, 0xffff_8000_0000_2000);
        save.cs.selector = 0x10;
        save.tr.selector = 0x40;
        save.fs.base = 0x7f00_0000_0000;
        save.gs.base = 0xffff_8800_0000_0000;
        save.sysenter_cs = 0x10;
        save.sysenter_eip = 0xdead_beef;

        let mut host = HostState::default();
        copy_state_to_host(&save, &mut host);

        assert_eq!(host.cr0, 0x8005_0033);
        assert_eq!(host.cr3, 0x1234_5000);
        // SVME never leaks back to the root OS
        assert_eq!(host.efer, EFER_LMA);
        assert_eq!(host.gdtr.base, 0xffff_8000_0000_1000);
        assert_eq!(host.gdtr.limit, 0x7f);
        assert_eq!(host.cs.selector, 0x10);
        assert_eq!(host.tss.selector, 0x40);
        assert_eq!(host.gs.base, 0xffff_8800_0000_0000);
        assert_eq!(host.sysenter_eip, 0xdead_beef);
    }

    #[test]
    fn setup_then_copy_back_preserves_host_state() {
        use crate::svm::msr::EFER_LMA;
        use crate::test_support::{test_cell, test_state, TestMem};

        let mem = TestMem::new();
        let cell = test_cell(&mem);
        let state = test_state();

        let mut host = HostState::default();
        host.cr0 = 0x8005_0033;
        host.cr3 = 0x1abc_d000;
        host.efer = EFER_LMA;
        host.cs = VmcbSegment::new(0x10, 0x29b, 0xffff_ffff, 0);
        host.tss = VmcbSegment::new(0x40, 0x8b, 0x206f, 0xffff_8000_0123_0000);
        host.gdtr.base = 0xffff_8000_0000_1000;
        host.gdtr.limit = 0x7f;
        host.idtr.base = 0xffff_8000_0000_2000;
        host.idtr.limit = 0xfff;
        host.fs.base = 0x7f00_0000_0000;
        host.gs.base = 0xffff_8800_0000_0000;
        host.sysenter_cs = 0x10;
        host.sysenter_esp = 0x1000;
        host.sysenter_eip = 0x2000;
        host.ip = 0xffff_8000_0040_0000;
        host.sp = 0xffff_8000_0050_0000;

        let mut cpu = PerCpu::new(0).unwrap();
        cpu.vmcb.setup(&host, &cell, state, &mem);

        assert_eq!(
            cpu.vmcb.save_area.rsp,
            host.sp + (NUM_ENTRY_REGS as u64 + 1) * 8
        );
        assert_eq!(cpu.vmcb.save_area.rip, host.ip);
        assert_eq!(cpu.vmcb.save_area.efer, host.efer | EFER_SVME);

        let mut back = HostState::default();
        copy_state_to_host(&cpu.vmcb.save_area, &mut back);

        assert_eq!(back.cr0, host.cr0);
        assert_eq!(back.cr3, host.cr3);
        assert_eq!(back.efer, host.efer);
        assert_eq!(back.gdtr, host.gdtr);
        assert_eq!(back.idtr, host.idtr);
        assert_eq!(back.cs.selector, host.cs.selector);
        assert_eq!(back.tss.selector, host.tss.selector);
        assert_eq!(back.fs.base, host.fs.base);
        assert_eq!(back.gs.base, host.gs.base);
        assert_eq!(back.sysenter_eip, host.sysenter_eip);
    }
}
