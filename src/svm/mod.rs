//! AMD-V (SVM) backend: capability probe, VMCB management, world switch
//! and the #VMEXIT dispatcher.

pub mod decode;
pub mod features;
pub mod msr;
pub mod msrpm;
pub mod npt;
pub mod vmcb;
pub mod vmexit;
pub mod vmlaunch;

use crate::error::{Error, Result};
use crate::platform::PhysMem;
use features::SvmFeatures;
use msrpm::MsrPermissionMap;
use npt::{MemFlags, NestedPageTable, PAGE_SIZE};
use spin::Once;

/// Architectural default base of the memory-mapped APIC page.
pub const XAPIC_BASE: u64 = 0xfee0_0000;

/// Guest-physical address the parking page is mapped at, chosen so the
/// parked loop starts at the 16-bit reset entry 0xf000:0xfff0.
const PARKING_PAGE_GPA: u64 = 0x000f_f000;

#[repr(C, align(4096))]
struct ParkingCode([u8; PAGE_SIZE as usize]);

const fn parking_code() -> ParkingCode {
    let mut page = [0u8; PAGE_SIZE as usize];
    page[0xff0] = 0xfa; /* 1: cli */
    page[0xff1] = 0xf4; /*    hlt */
    page[0xff2] = 0xeb;
    page[0xff3] = 0xfc; /*    jmp 1b */
    ParkingCode(page)
}

/// Loop executed by parked CPUs, shared between cells and CPUs.
static PARKING_CODE: ParkingCode = parking_code();

/// System-wide SVM state, built once during bring-up.
pub struct SvmState {
    pub features: SvmFeatures,
    /// Root of the minimal NPT active while a CPU is parked. It maps only
    /// the parking page.
    pub parking_root_pa: u64,
    /// APIC backing page shared by all cells, present only with AVIC.
    pub avic_page_pa: Option<u64>,
    msrpm: MsrPermissionMap,
}

impl SvmState {
    pub fn msrpm_pa(&self, mem: &dyn PhysMem) -> u64 {
        mem.phys(self.msrpm.as_ptr())
    }

    pub fn msrpm(&self) -> &MsrPermissionMap {
        &self.msrpm
    }
}

static SVM_STATE: Once<SvmState> = Once::new();

#[cfg(test)]
pub(crate) fn state_for_tests(features: SvmFeatures, parking_root_pa: u64) -> SvmState {
    SvmState {
        features,
        parking_root_pa,
        avic_page_pa: None,
        msrpm: MsrPermissionMap::new(),
    }
}

/// Probes SVM, installs the parking page table and prepares the MSR
/// permission map. Called once on the boot CPU; later calls return the
/// existing state.
pub fn vendor_init(mem: &dyn PhysMem, using_x2apic: bool) -> Result<&'static SvmState> {
    if let Some(state) = SVM_STATE.get() {
        return Ok(state);
    }

    let features = features::probe()?;

    let mut parking_npt = NestedPageTable::new(mem)?;
    parking_npt.map(
        mem,
        PARKING_PAGE_GPA,
        mem.phys(PARKING_CODE.0.as_ptr()),
        PAGE_SIZE,
        MemFlags::READ | MemFlags::EXECUTE,
    )?;

    let mut msrpm = MsrPermissionMap::new();
    // This is always false for AMD today (except under nested SVM), see
    // APMv2, Sect. 16.3.1.
    let avic_page_pa = if using_x2apic {
        msrpm.set_x2apic_passthrough();
        None
    } else if features.avic {
        Some(mem.alloc_pages(1).ok_or(Error::OutOfMemory)?)
    } else {
        None
    };

    log::info!(
        "SVM initialized (decode assists: {}, flush by ASID: {}, AVIC: {})",
        features.decode_assists,
        features.flush_by_asid,
        features.avic
    );

    Ok(SVM_STATE.call_once(|| SvmState {
        features,
        parking_root_pa: parking_npt.root_pa(),
        avic_page_pa,
        msrpm,
    }))
}
