//! Init-path error taxonomy.
//!
//! Only bring-up operations (feature probe, vendor init, cell creation,
//! per-CPU init) return these. Runtime exit handling never produces an
//! error value: a vCPU either resumes or its core is parked with a
//! diagnostic dump.

use snafu::Snafu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum Error {
    /// CPUID reports no SVM extensions.
    #[snafu(display("SVM extensions are not available on this processor"))]
    SvmUnsupported,

    /// SVM is present but nested paging is not. There is no shadow-paging
    /// fallback in this design.
    #[snafu(display("nested paging is not supported"))]
    NestedPagingUnsupported,

    /// VM_CR.SVMDIS is set; the platform firmware locked SVM off.
    #[snafu(display("SVM is disabled by firmware"))]
    DisabledByFirmware,

    /// EFER.SVME was already set when this core tried to enable SVM.
    #[snafu(display("SVM is already enabled on this core"))]
    AlreadyEnabled,

    /// The page pool could not satisfy an allocation.
    #[snafu(display("out of pages"))]
    OutOfMemory,

    /// The root OS left reserved CR0 bits set that this hypervisor does not
    /// model; virtualizing such a context would not be transparent.
    #[snafu(display("reserved CR0 bits set by the host context"))]
    ReservedCr0Bits,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
