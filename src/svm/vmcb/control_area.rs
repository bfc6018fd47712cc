//! VMCB control area, offsets per `Appendix B - Layout of VMCB` in the
//! AMD64 Architecture Programmer's Manual Volume 2.

use bitflags::bitflags;

// Size: 0x400
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008

    pub general1_intercepts: General1Intercepts, // +0x00c
    pub general2_intercepts: General2Intercepts, // +0x010
    pub reserved1: [u8; 0x03c - 0x014],          // +0x014
    pub pause_filter_threshold: u16,             // +0x03c
    pub pause_filter_count: u16,                 // +0x03e
    pub iopm_base_pa: u64,                       // +0x040
    pub msrpm_base_pa: u64,                      // +0x048
    pub tsc_offset: u64,                         // +0x050
    pub guest_asid: u32,                         // +0x058
    pub tlb_control: u32,                        // +0x05c
    pub vintr: u64,                              // +0x060
    pub interrupt_shadow: u64,                   // +0x068
    pub exitcode: u64,                           // +0x070
    pub exitinfo1: u64,                          // +0x078
    pub exitinfo2: u64,                          // +0x080
    pub exit_int_info: u64,                      // +0x088
    pub np_enable: u64,                          // +0x090
    pub avic_apic_bar: u64,                      // +0x098
    pub guest_pa_of_ghcb: u64,                   // +0x0a0
    pub event_inj: u64,                          // +0x0a8
    pub n_cr3: u64,                              // +0x0b0
    pub lbr_virtualization_enable: u64,          // +0x0b8
    pub clean_bits: CleanBits,                   // +0x0c0
    pub reserved2: u32,                          // +0x0c4
    pub nrip: u64,                               // +0x0c8
    pub bytes_fetched: u8,                       // +0x0d0
    pub guest_bytes: [u8; 15],                   // +0x0d1
    pub avic_backing_page: u64,                  // +0x0e0
    pub reserved3: u64,                          // +0x0e8
    pub avic_logical_table: u64,                 // +0x0f0
    pub avic_physical_table: u64,                // +0x0f8
    pub reserved4: u64,                          // +0x100
    pub vmsa_pointer: u64,                       // +0x108
    pub reserved5: [u8; 0x400 - 0x110],          // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

impl ControlArea {
    /// Instruction bytes captured by hardware decode assists for this exit.
    /// Empty without the capability or when the exit type does not fill the
    /// buffer.
    pub fn fetched_inst_bytes(&self) -> &[u8] {
        let len = (self.bytes_fetched as usize).min(self.guest_bytes.len());
        &self.guest_bytes[..len]
    }
}

/// TLB control values (offset 0x05c). Flush-by-ASID requires the matching
/// CPUID capability; legacy parts only support the full flush.
pub const TLB_FLUSH_ALL: u32 = 0x01;
pub const TLB_FLUSH_GUEST: u32 = 0x03;

/// NP_ENABLE bit 0.
pub const NP_ENABLE_NESTED_PAGING: u64 = 1 << 0;

bitflags! {
    /// See `15.15.3 VMCB Clean Field`.
    ///
    /// A set bit tells the hardware the corresponding guest-state group is
    /// unmodified and may be loaded from its cached copy. The dispatcher
    /// sets the whole mask on every exit; handlers that touch a group must
    /// clear its bit before resuming.
    pub struct CleanBits: u32 {
        /// Intercept vectors, TSC offset, pause filter.
        const INTERCEPTS = 1 << 0;

        /// IOPM_BASE, MSRPM_BASE.
        const IOMSRPM = 1 << 1;

        /// ASID.
        const ASID = 1 << 2;

        /// Virtual interrupt control (offsets 0x60-0x67).
        const TPR = 1 << 3;

        /// Nested paging: N_CR3, G_PAT.
        const NP = 1 << 4;

        /// CR0, CR3, CR4, EFER.
        const CRX = 1 << 5;

        /// DR6, DR7.
        const DRX = 1 << 6;

        /// GDT/IDT limit and base.
        const DT = 1 << 7;

        /// CS/DS/SS/ES selector/base/limit/attrib, CPL.
        const SEG = 1 << 8;

        /// CR2.
        const CR2 = 1 << 9;

        /// Debug control, last-branch records.
        const LBR = 1 << 10;

        /// AVIC APIC_BAR and table pointers.
        const AVIC = 1 << 11;

        /// S_CET, SSP, ISST_ADDR.
        const CET = 1 << 12;
    }

    pub struct General1Intercepts: u32 {
        const INTR          = 1 << 0;
        const NMI           = 1 << 1;
        const SMI           = 1 << 2;
        const INIT          = 1 << 3;
        const VINTR         = 1 << 4;
        const CR0_SEL_WRITE = 1 << 5;
        const READ_IDTR     = 1 << 6;
        const READ_GDTR     = 1 << 7;
        const READ_LDTR     = 1 << 8;
        const READ_TR       = 1 << 9;
        const WRITE_IDTR    = 1 << 10;
        const WRITE_GDTR    = 1 << 11;
        const WRITE_LDTR    = 1 << 12;
        const WRITE_TR      = 1 << 13;
        const RDTSC         = 1 << 14;
        const RDPMC         = 1 << 15;
        const PUSHF         = 1 << 16;
        const POPF          = 1 << 17;
        const CPUID         = 1 << 18;
        const RSM           = 1 << 19;
        const IRET          = 1 << 20;
        const INTN          = 1 << 21;
        const INVD          = 1 << 22;
        const PAUSE         = 1 << 23;
        const HLT           = 1 << 24;
        const INVLPG        = 1 << 25;
        const INVLPGA       = 1 << 26;
        const IOIO_PROT     = 1 << 27;
        const MSR_PROT      = 1 << 28;
        const TASK_SWITCH   = 1 << 29;
        const FERR_FREEZE   = 1 << 30;
        const SHUTDOWN_EVT  = 1 << 31;
    }

    pub struct General2Intercepts: u32 {
        const VMRUN   = 1 << 0;
        const VMMCALL = 1 << 1;
        const VMLOAD  = 1 << 2;
        const VMSAVE  = 1 << 3;
        const STGI    = 1 << 4;
        const CLGI    = 1 << 5;
        const SKINIT  = 1 << 6;
        const RDTSCP  = 1 << 7;
        const ICEBP   = 1 << 8;
        const WBINVD  = 1 << 9;
        const MONITOR = 1 << 10;
        const MWAIT   = 1 << 11;
        const XSETBV  = 1 << 13;
    }

    /// EXITINFO1 layout of a nested page fault, mirroring a #PF error code.
    /// See `15.25.6 Nested versus Guest Page Faults, Fault Ordering`.
    pub struct NptExitInfo: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const RSVD     = 1 << 3;
        const EXECUTE  = 1 << 4;

        /// Fault occurred while translating the guest's final physical
        /// address (as opposed to its page tables).
        const FINAL_PA = 1 << 32;
    }
}

/// Exit reasons this backend models. Everything else is routed to the fatal
/// path by [`ExitCode::from_raw`] returning `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ExitCode {
    Nmi = 0x61,
    Cr0SelWrite = 0x65,
    Cpuid = 0x72,
    Ioio = 0x7b,
    Msr = 0x7c,
    Vmmcall = 0x81,
    Xsetbv = 0x8d,
    Npf = 0x400,
    /// VMRUN failed; exitcode is all-ones.
    Invalid = u64::MAX,
}

impl ExitCode {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0x61 => Some(Self::Nmi),
            0x65 => Some(Self::Cr0SelWrite),
            0x72 => Some(Self::Cpuid),
            0x7b => Some(Self::Ioio),
            0x7c => Some(Self::Msr),
            0x81 => Some(Self::Vmmcall),
            0x8d => Some(Self::Xsetbv),
            0x400 => Some(Self::Npf),
            u64::MAX => Some(Self::Invalid),
            _ => None,
        }
    }
}
