//! AMD-V (SVM) virtual-CPU backend of a bare-metal partitioning hypervisor.
//!
//! Each physical core runs exactly one virtual CPU. The privileged "root"
//! guest and any number of isolated cells execute directly on hardware; this
//! crate programs the per-core VMCB, drives the guest entry/exit transitions
//! and emulates the small set of intercepted operations (CR0 writes, MSR
//! accesses, programmed I/O, nested page faults, hypercalls, CPU bring-up).
//!
//! The generic page allocator, APIC emulation, hypercall dispatcher and the
//! MMIO/PIO fault handlers are external collaborators, reached through the
//! traits in [`platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod cell;
pub mod error;
pub mod percpu;
pub mod platform;
pub mod stats;
pub mod svm;

#[cfg(test)]
pub(crate) mod test_support;
