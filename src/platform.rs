//! Interfaces to the subsystems this backend consumes but does not own.
//!
//! The embedding hypervisor implements these traits; the vCPU core only
//! calls through them. Nothing here suspends: every call either completes
//! or reports failure to the caller.

use crate::percpu::GuestRegisters;
use crate::svm::decode::GuestPagingMode;

/// Contiguous page allocation and address conversion for the hypervisor
/// memory pool.
///
/// The backend stores page-table entries and control-block base pointers as
/// host-physical addresses but walks them through host-virtual pointers, so
/// both directions are needed.
pub trait PhysMem {
    /// Allocates `count` contiguous zeroed pages. Returns the host-physical
    /// base address, or `None` on exhaustion.
    fn alloc_pages(&self, count: usize) -> Option<u64>;

    /// Returns pages obtained from [`PhysMem::alloc_pages`].
    fn free_pages(&self, pa: u64, count: usize);

    /// Host-physical to host-virtual.
    fn virt(&self, pa: u64) -> *mut u8;

    /// Host-virtual to host-physical.
    fn phys(&self, va: *const u8) -> u64;
}

/// Snapshot of the execution state handed to the hypercall dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionState {
    pub efer: u64,
    pub rflags: u64,
    pub cs: u16,
    pub rip: u64,
}

/// Decoded nested-page-fault intercept, for the generic MMIO handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfIntercept {
    pub phys_addr: u64,
    pub is_write: bool,
}

/// Decoded programmed-I/O intercept (APM 15.10.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoIntercept {
    pub port: u16,
    /// Operand size class: 1, 2 or 4 bytes, as the raw SZ8/SZ16/SZ32 field.
    pub size: u8,
    pub is_in: bool,
    pub inst_len: u64,
    pub rep_or_str: bool,
}

/// External collaborators invoked from the exit dispatcher.
///
/// Handlers returning `bool` report whether the access was modeled; an
/// unhandled access is fatal for the core, decided by the dispatcher.
pub trait Platform {
    /// MMIO-style access to the intercepted xAPIC page. Returns the length
    /// of the emulated instruction, or `None` if the access could not be
    /// emulated.
    fn apic_mmio_access(
        &mut self,
        regs: &mut GuestRegisters,
        pc: u64,
        pg_mode: GuestPagingMode,
        reg: u32,
        is_write: bool,
    ) -> Option<u64>;

    /// Emulated read from the x2APIC MSR window.
    fn x2apic_handle_read(&mut self, regs: &mut GuestRegisters);

    /// Emulated write to the x2APIC MSR window.
    fn x2apic_handle_write(&mut self, regs: &mut GuestRegisters) -> bool;

    /// Hypercall dispatch; semantics are entirely the collaborator's.
    fn handle_hypercall(&mut self, regs: &mut GuestRegisters, state: &ExecutionState);

    /// Generic nested-page-fault / MMIO handler.
    fn handle_pt_violation(&mut self, regs: &mut GuestRegisters, pf: &PfIntercept) -> bool;

    /// Generic programmed-I/O handler.
    fn handle_io_access(&mut self, regs: &mut GuestRegisters, io: &IoIntercept) -> bool;

    /// Polls queued management events for this core. Returns a pending
    /// startup (SIPI) vector, if any.
    fn handle_events(&mut self, cpu_id: u32) -> Option<u32>;

    /// Drains pending address-translation faults of attached I/O devices.
    fn check_pending_iommu_faults(&mut self, cpu_id: u32);
}

/// Guest-physical memory reads, used by the instruction fetcher.
pub trait GuestMemory {
    /// Reads `buf.len()` bytes at guest-physical `gpa`. Returns `false` if
    /// any part of the range is not mapped for the cell.
    fn read(&self, gpa: u64, buf: &mut [u8]) -> bool;
}
