//! Shared fakes for unit tests: a heap-backed physical memory pool, a
//! recording platform, and a sparse guest memory.

use crate::cell::Cell;
use crate::platform::{ExecutionState, GuestMemory, IoIntercept, PfIntercept, PhysMem, Platform};
use crate::percpu::GuestRegisters;
use crate::svm::decode::GuestPagingMode;
use crate::svm::features::SvmFeatures;
use crate::svm::SvmState;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

/// Arena posing as host-physical memory. Physical addresses are offsets
/// into one zeroed, page-aligned allocation; page allocation is a simple
/// bump pointer starting above the addresses tests like to map directly.
pub(crate) struct TestMem {
    arena: *mut u8,
    next: core::cell::Cell<u64>,
}

const ARENA_SIZE: u64 = 0x100_0000;
const ALLOC_BASE: u64 = 0x10_0000;
const PAGE_SIZE: u64 = 4096;

impl TestMem {
    pub(crate) fn new() -> Self {
        let layout = core::alloc::Layout::from_size_align(ARENA_SIZE as usize, 4096).unwrap();
        let arena = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!arena.is_null());
        Self {
            arena,
            next: core::cell::Cell::new(ALLOC_BASE),
        }
    }
}

impl Drop for TestMem {
    fn drop(&mut self) {
        let layout = core::alloc::Layout::from_size_align(ARENA_SIZE as usize, 4096).unwrap();
        unsafe { alloc::alloc::dealloc(self.arena, layout) };
    }
}

impl PhysMem for TestMem {
    fn alloc_pages(&self, count: usize) -> Option<u64> {
        let pa = self.next.get();
        let end = pa + count as u64 * PAGE_SIZE;
        if end > ARENA_SIZE {
            return None;
        }
        self.next.set(end);
        Some(pa)
    }

    fn free_pages(&self, _pa: u64, _count: usize) {}

    fn virt(&self, pa: u64) -> *mut u8 {
        assert!(pa < ARENA_SIZE, "out-of-arena physical address {:#x}", pa);
        unsafe { self.arena.add(pa as usize) }
    }

    fn phys(&self, va: *const u8) -> u64 {
        let addr = va as u64;
        let base = self.arena as u64;
        if (base..base + ARENA_SIZE).contains(&addr) {
            addr - base
        } else {
            addr
        }
    }
}

pub(crate) fn test_cell(mem: &TestMem) -> Cell {
    Cell::new(0, "root", mem, None).unwrap()
}

pub(crate) fn test_state() -> &'static SvmState {
    let features = SvmFeatures {
        decode_assists: true,
        flush_by_asid: true,
        avic: false,
    };
    Box::leak(Box::new(crate::svm::state_for_tests(features, 0x7000_0000)))
}

/// Platform fake that records every callback and answers from canned
/// fields.
#[derive(Default)]
pub(crate) struct FakePlatform {
    pub pending_sipi: Option<u32>,
    pub events_polled: u32,
    pub iommu_checks: u32,

    pub last_hypercall: Option<ExecutionState>,

    pub apic_inst_len: Option<u64>,
    pub last_apic_access: Option<(u32, bool)>,

    pub x2apic_reads: u32,
    pub x2apic_write_ok: bool,
    pub x2apic_writes: u32,

    pub handle_pf: bool,
    pub last_pf: Option<PfIntercept>,

    pub handle_io: bool,
    pub last_io: Option<IoIntercept>,
    pub io_rax: Option<u64>,
    pub seen_rax: Option<u64>,
}

impl Platform for FakePlatform {
    fn apic_mmio_access(
        &mut self,
        _regs: &mut GuestRegisters,
        _pc: u64,
        _pg_mode: GuestPagingMode,
        reg: u32,
        is_write: bool,
    ) -> Option<u64> {
        self.last_apic_access = Some((reg, is_write));
        self.apic_inst_len
    }

    fn x2apic_handle_read(&mut self, _regs: &mut GuestRegisters) {
        self.x2apic_reads += 1;
    }

    fn x2apic_handle_write(&mut self, _regs: &mut GuestRegisters) -> bool {
        self.x2apic_writes += 1;
        self.x2apic_write_ok
    }

    fn handle_hypercall(&mut self, _regs: &mut GuestRegisters, state: &ExecutionState) {
        self.last_hypercall = Some(*state);
    }

    fn handle_pt_violation(&mut self, _regs: &mut GuestRegisters, pf: &PfIntercept) -> bool {
        self.last_pf = Some(*pf);
        self.handle_pf
    }

    fn handle_io_access(&mut self, regs: &mut GuestRegisters, io: &IoIntercept) -> bool {
        self.last_io = Some(*io);
        self.seen_rax = Some(regs.rax);
        if let Some(rax) = self.io_rax {
            regs.rax = rax;
        }
        self.handle_io
    }

    fn handle_events(&mut self, _cpu_id: u32) -> Option<u32> {
        self.events_polled += 1;
        self.pending_sipi.take()
    }

    fn check_pending_iommu_faults(&mut self, _cpu_id: u32) {
        self.iommu_checks += 1;
    }
}

/// Sparse byte-addressed guest memory for the instruction parser and page
/// walker tests.
#[derive(Default)]
pub(crate) struct FakeGuestMem {
    bytes: BTreeMap<u64, u8>,
}

impl FakeGuestMem {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&mut self, gpa: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(gpa + i as u64, *byte);
        }
    }

    pub(crate) fn write_u64(&mut self, gpa: u64, value: u64) {
        self.write(gpa, &value.to_le_bytes());
    }

    pub(crate) fn write_u32(&mut self, gpa: u64, value: u32) {
        self.write(gpa, &value.to_le_bytes());
    }
}

impl GuestMemory for FakeGuestMem {
    fn read(&self, gpa: u64, buf: &mut [u8]) -> bool {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.bytes.get(&(gpa + i as u64)) {
                Some(byte) => *slot = *byte,
                None => return false,
            }
        }
        true
    }
}
