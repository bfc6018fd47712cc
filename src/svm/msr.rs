//! MSR numbers, EFER/CR bit masks and reset constants used by the SVM
//! backend. SVM-specific numbers are spelled out here rather than pulled
//! from the `x86` crate so the permission-map builder can reference them in
//! `const` context.

pub const MSR_SYSENTER_CS: u32 = 0x174;
pub const MSR_SYSENTER_ESP: u32 = 0x175;
pub const MSR_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_PAT: u32 = 0x277;

/// MTRR default-type register; its write is trapped for a minimal
/// emulation.
pub const MSR_MTRR_DEFTYPE: u32 = 0x2ff;

pub const MSR_X2APIC_BASE: u32 = 0x800;
pub const MSR_X2APIC_ICR: u32 = 0x830;
pub const MSR_X2APIC_END: u32 = 0x83f;

pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SFMASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNGS_BASE: u32 = 0xc000_0102;

/// VM_CR MSR (`15.30.1`); SVMDIS reports the firmware lock.
pub const MSR_VM_CR: u32 = 0xc001_0114;
pub const VM_CR_SVMDIS: u64 = 1 << 4;

/// Physical address of the host state-save area consumed by VMRUN.
pub const MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;
pub const EFER_SVME: u64 = 1 << 12;

pub const X86_CR0_PE: u64 = 1 << 0;
pub const X86_CR0_MP: u64 = 1 << 1;
pub const X86_CR0_ET: u64 = 1 << 4;
pub const X86_CR0_NE: u64 = 1 << 5;
pub const X86_CR0_WP: u64 = 1 << 16;
pub const X86_CR0_NW: u64 = 1 << 29;
pub const X86_CR0_CD: u64 = 1 << 30;
pub const X86_CR0_PG: u64 = 1 << 31;

/// Reserved CR0 bits this backend assumes to be clear in the host context.
pub const X86_CR0_RESERVED: u64 = 0x1ffa_ffc0;

pub const X86_CR4_PAE: u64 = 1 << 5;

pub const X86_XCR0_FP: u64 = 1 << 0;

/// The NW bit is ignored by all modern processors, but some combinations of
/// NW and CD are prohibited under SVM (APMv2, Sect. 15.5). NW is therefore
/// kept off unconditionally.
pub const SVM_CR0_ALLOWED_BITS: u64 = !X86_CR0_NW;

/// Architectural power-on value of IA32_PAT.
pub const PAT_RESET_VALUE: u64 = 0x0007_0406_0007_0406;

/// Reset values of the debug registers and RFLAGS per the power-on state
/// table.
pub const DR6_RESET_VALUE: u64 = 0x0000_0ff0;
pub const DR7_RESET_VALUE: u64 = 0x0000_0400;
pub const RFLAGS_RESET_VALUE: u64 = 0x02;
