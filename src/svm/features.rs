//! SVM capability probe.

use crate::error::{Error, Result};
use crate::svm::msr::{MSR_VM_CR, VM_CR_SVMDIS};
use x86::cpuid::cpuid;
use x86::msr::rdmsr;

const CPUID_EXT_FEATURES: u32 = 0x8000_0001;
const CPUID_SVM_FEATURES: u32 = 0x8000_000a;

const EXT_FEAT_SVM: u32 = 1 << 2;

const SVM_FEAT_NPT: u32 = 1 << 0;
const SVM_FEAT_FLUSH_BY_ASID: u32 = 1 << 6;
const SVM_FEAT_DECODE_ASSISTS: u32 = 1 << 7;
const SVM_FEAT_AVIC: u32 = 1 << 13;

/// Optional SVM capabilities the backend adapts to. Nested paging is not
/// listed: it is mandatory, [`probe`] fails without it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvmFeatures {
    pub decode_assists: bool,
    pub flush_by_asid: bool,
    pub avic: bool,
}

/// Checks that this core can run the backend and reports the optional
/// capabilities. Must be called on every core; mixed-capability systems are
/// not supported.
pub fn probe() -> Result<SvmFeatures> {
    let ext = cpuid!(CPUID_EXT_FEATURES);
    if ext.ecx & EXT_FEAT_SVM == 0 {
        return Err(Error::SvmUnsupported);
    }

    if unsafe { rdmsr(MSR_VM_CR) } & VM_CR_SVMDIS != 0 {
        return Err(Error::DisabledByFirmware);
    }

    let svm = cpuid!(CPUID_SVM_FEATURES);
    if svm.edx & SVM_FEAT_NPT == 0 {
        return Err(Error::NestedPagingUnsupported);
    }

    Ok(SvmFeatures {
        decode_assists: svm.edx & SVM_FEAT_DECODE_ASSISTS != 0,
        flush_by_asid: svm.edx & SVM_FEAT_FLUSH_BY_ASID != 0,
        avic: svm.edx & SVM_FEAT_AVIC != 0,
    })
}
