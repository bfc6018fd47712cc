//! MSR permission map.
//!
//! Four 8 KiB banks, one per architectural MSR range (APM 15.11). Each MSR
//! owns two consecutive bits, read then write; a set bit intercepts. One
//! byte therefore covers four MSRs.

use crate::svm::msr::{MSR_X2APIC_BASE, MSR_X2APIC_END, MSR_X2APIC_ICR};

const BANK_SIZE: usize = 0x2000;

const BANK_0000: usize = 0;
const BANK_C000: usize = 1;
const BANK_C001: usize = 2;

#[repr(C, align(4096))]
pub struct MsrPermissionMap {
    banks: [[u8; BANK_SIZE]; 4],
}

const fn bank_0000() -> [u8; BANK_SIZE] {
    let mut bank = [0u8; BANK_SIZE];

    bank[0x01b / 4] = 0x80; /* 0x01b (w) */
    bank[0x2ff / 4] = 0x80; /* 0x2ff (w) */

    /* x2APIC MSRs, emulated while the APIC is in xAPIC mode */
    bank[0x800 / 4] = 0x90; /* 0x802 (r), 0x803 (r) */
    bank[0x808 / 4] = 0x93; /* 0x808 (rw), 0x80a (r), 0x80b (w) */
    bank[0x80c / 4] = 0xc8; /* 0x80d (w), 0x80f (rw) */
    let mut i = 0x810 / 4;
    while i <= 0x824 / 4 {
        bank[i] = 0x55; /* 0x810 - 0x827 (r) */
        i += 1;
    }
    bank[0x828 / 4] = 0x03; /* 0x828 (rw) */
    bank[0x82c / 4] = 0xc0; /* 0x82f (rw) */
    bank[0x830 / 4] = 0xf3; /* 0x830 (rw), 0x832 (rw), 0x833 (rw) */
    bank[0x834 / 4] = 0xff; /* 0x834 - 0x837 (rw) */
    bank[0x838 / 4] = 0x07; /* 0x838 (rw), 0x839 (r) */
    bank[0x83c / 4] = 0x70; /* 0x83e (rw), 0x83f (r) */

    bank
}

const fn bank_c000() -> [u8; BANK_SIZE] {
    let mut bank = [0u8; BANK_SIZE];
    bank[0x080 / 4] = 0x02; /* EFER (w) */
    bank
}

impl MsrPermissionMap {
    pub const fn new() -> Self {
        Self {
            banks: [
                bank_0000(),
                bank_c000(),
                [0; BANK_SIZE],
                [0; BANK_SIZE],
            ],
        }
    }

    /// Opens the x2APIC register window for direct guest access, except the
    /// ICR write which always needs moderation. Only valid before the map
    /// is handed to hardware.
    pub fn set_x2apic_passthrough(&mut self) {
        let start = MSR_X2APIC_BASE as usize / 4;
        let end = MSR_X2APIC_END as usize / 4;
        for byte in &mut self.banks[BANK_0000][start..=end] {
            *byte = 0;
        }
        self.banks[BANK_0000][MSR_X2APIC_ICR as usize / 4] = 0x02;
    }

    /// Whether the given access traps. MSRs outside the four mapped ranges
    /// are intercepted unconditionally by hardware.
    pub fn is_intercepted(&self, msr: u32, write: bool) -> bool {
        let (bank, offset) = match msr {
            0x0000_0000..=0x0000_1fff => (BANK_0000, msr),
            0xc000_0000..=0xc000_1fff => (BANK_C000, msr - 0xc000_0000),
            0xc001_0000..=0xc001_1fff => (BANK_C001, msr - 0xc001_0000),
            _ => return true,
        };
        let bit = (offset % 4) * 2 + write as u32;
        self.banks[bank][offset as usize / 4] & (1 << bit) != 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.banks.as_ptr() as *const u8
    }
}
