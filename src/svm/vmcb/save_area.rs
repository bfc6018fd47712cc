//! VMCB state-save area. Offsets are relative to the save area, not the
//! VMCB as a whole.

/// One segment slot of the save area: selector, the packed 12-bit SVM
/// attribute byte pair, limit and base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct VmcbSegment {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}
const_assert_eq!(core::mem::size_of::<VmcbSegment>(), 16);

impl VmcbSegment {
    pub const fn new(selector: u16, attrib: u16, limit: u32, base: u64) -> Self {
        Self {
            selector,
            attrib,
            limit,
            base,
        }
    }
}

// Size: 0x298
#[repr(C)]
pub struct SaveArea {
    pub es: VmcbSegment,   // +0x000
    pub cs: VmcbSegment,   // +0x010
    pub ss: VmcbSegment,   // +0x020
    pub ds: VmcbSegment,   // +0x030
    pub fs: VmcbSegment,   // +0x040
    pub gs: VmcbSegment,   // +0x050
    pub gdtr: VmcbSegment, // +0x060
    pub ldtr: VmcbSegment, // +0x070
    pub idtr: VmcbSegment, // +0x080
    pub tr: VmcbSegment,   // +0x090

    pub reserved1: [u8; 43], // +0x0a0
    pub cpl: u8,             // +0x0cb
    pub reserved2: u32,      // +0x0cc
    pub efer: u64,           // +0x0d0
    pub reserved3: [u8; 112],
    pub cr4: u64,    // +0x148
    pub cr3: u64,    // +0x150
    pub cr0: u64,    // +0x158
    pub dr7: u64,    // +0x160
    pub dr6: u64,    // +0x168
    pub rflags: u64, // +0x170
    pub rip: u64,    // +0x178
    pub reserved4: [u8; 88],
    pub rsp: u64, // +0x1d8
    pub reserved5: [u8; 24],
    pub rax: u64,            // +0x1f8
    pub star: u64,           // +0x200
    pub lstar: u64,          // +0x208
    pub cstar: u64,          // +0x210
    pub sfmask: u64,         // +0x218
    pub kernel_gs_base: u64, // +0x220
    pub sysenter_cs: u64,    // +0x228
    pub sysenter_esp: u64,   // +0x230
    pub sysenter_eip: u64,   // +0x238
    pub cr2: u64,            // +0x240
    pub reserved6: [u8; 32],
    pub g_pat: u64,   // +0x268
    pub dbg_ctl: u64, // +0x270
    pub br_from: u64,
    pub br_to: u64,
    pub last_excep_from: u64,
    pub last_excep_to: u64,
}
const_assert_eq!(core::mem::size_of::<SaveArea>(), 0x298);
