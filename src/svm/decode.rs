//! Guest-side address translation and minimal instruction decode, used when
//! hardware decode assists are unavailable.

use crate::platform::GuestMemory;
use crate::svm::msr::{EFER_LMA, X86_CR0_PG, X86_CR4_PAE};
use crate::svm::vmcb::save_area::SaveArea;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_PS: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Paging mode the guest executes in, derived from its control registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestPagingMode {
    /// 4-level long-mode paging.
    Long { root: u64 },
    /// Non-PAE 32-bit paging, 4-byte entries.
    Legacy32 { root: u64 },
    /// Paging disabled; also covers non-paged protected mode, the
    /// translation is the same.
    RealMode,
}

impl GuestPagingMode {
    /// Returns `None` for PAE-without-long-mode, which is not modeled.
    pub fn from_save_area(save: &SaveArea) -> Option<Self> {
        if save.efer & EFER_LMA != 0 {
            Some(GuestPagingMode::Long {
                root: save.cr3 & PTE_ADDR_MASK,
            })
        } else if save.cr0 & X86_CR0_PG != 0 && save.cr4 & X86_CR4_PAE == 0 {
            Some(GuestPagingMode::Legacy32 {
                root: save.cr3 & 0xffff_f000,
            })
        } else if save.cr0 & X86_CR0_PG == 0 {
            Some(GuestPagingMode::RealMode)
        } else {
            None
        }
    }
}

fn read_u64(guest_mem: &dyn GuestMemory, gpa: u64) -> Option<u64> {
    let mut buf = [0u8; 8];
    guest_mem.read(gpa, &mut buf).then(|| u64::from_le_bytes(buf))
}

fn read_u32(guest_mem: &dyn GuestMemory, gpa: u64) -> Option<u32> {
    let mut buf = [0u8; 4];
    guest_mem.read(gpa, &mut buf).then(|| u32::from_le_bytes(buf))
}

/// Walks the guest's page tables for a linear address. Returns the
/// guest-physical address, or `None` if any level is not present or not
/// readable.
pub fn virt_to_gphys(
    mode: GuestPagingMode,
    va: u64,
    guest_mem: &dyn GuestMemory,
) -> Option<u64> {
    match mode {
        GuestPagingMode::RealMode => Some(va),
        GuestPagingMode::Long { root } => {
            let mut table = root;
            for level in (1..=4).rev() {
                let index = (va >> (12 + 9 * (level - 1))) & 0x1ff;
                let pte = read_u64(guest_mem, table + index * 8)?;
                if pte & PTE_PRESENT == 0 {
                    return None;
                }
                if level == 1 {
                    return Some((pte & PTE_ADDR_MASK) | (va & 0xfff));
                }
                // 1 GiB and 2 MiB pages
                if pte & PTE_PS != 0 && level <= 3 {
                    let page_mask = (1u64 << (12 + 9 * (level - 1))) - 1;
                    return Some((pte & PTE_ADDR_MASK & !page_mask) | (va & page_mask));
                }
                table = pte & PTE_ADDR_MASK;
            }
            None
        }
        GuestPagingMode::Legacy32 { root } => {
            let va = va & 0xffff_ffff;
            let pde = read_u32(guest_mem, root + ((va >> 22) & 0x3ff) * 4)? as u64;
            if pde & PTE_PRESENT == 0 {
                return None;
            }
            if pde & PTE_PS != 0 {
                return Some((pde & 0xffc0_0000) | (va & 0x3f_ffff));
            }
            let pte = read_u32(guest_mem, (pde & 0xffff_f000) + ((va >> 12) & 0x3ff) * 4)? as u64;
            if pte & PTE_PRESENT == 0 {
                return None;
            }
            Some((pte & 0xffff_f000) | (va & 0xfff))
        }
    }
}

/// Fetches instruction bytes at the guest's program counter, walking its
/// page tables byte-wise so page-crossing fetches work.
pub fn fetch_inst_bytes(
    mode: GuestPagingMode,
    pc: u64,
    buf: &mut [u8],
    guest_mem: &dyn GuestMemory,
) -> bool {
    for (i, byte) in buf.iter_mut().enumerate() {
        let gpa = match virt_to_gphys(mode, pc + i as u64, guest_mem) {
            Some(gpa) => gpa,
            None => return false,
        };
        let mut one = [0u8; 1];
        if !guest_mem.read(gpa, &mut one) {
            return false;
        }
        *byte = one[0];
    }
    true
}

fn match_mov_to_cr(bytes: &[u8], expected_cr: u8) -> Option<u8> {
    if bytes.len() < 3 || bytes[0] != 0x0f || bytes[1] != 0x22 {
        return None;
    }
    let modrm = bytes[2];
    if (modrm >> 3) & 0x7 != expected_cr {
        return None;
    }
    Some(modrm & 0x7)
}

/// Decodes a `mov crN, reg` at the guest's program counter. No prefixes are
/// supported. Returns the source GPR encoding if the instruction matches
/// and its ModRM names the expected control register.
///
/// `prefetched` is the instruction-byte buffer hardware may have captured
/// with the exit; when it holds the full instruction, no guest memory walk
/// is needed.
pub fn parse_mov_to_cr(
    save: &SaveArea,
    pc: u64,
    expected_cr: u8,
    prefetched: &[u8],
    guest_mem: &dyn GuestMemory,
) -> Option<u8> {
    if prefetched.len() >= 3 {
        return match_mov_to_cr(prefetched, expected_cr);
    }

    let mode = GuestPagingMode::from_save_area(save)?;
    let cs_base = if save.efer & EFER_LMA != 0 {
        0
    } else {
        save.cs.base
    };

    let mut bytes = [0u8; 3];
    if !fetch_inst_bytes(mode, cs_base + pc, &mut bytes, guest_mem) {
        return None;
    }
    match_mov_to_cr(&bytes, expected_cr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::msr::EFER_SVME;
    use crate::test_support::FakeGuestMem;

    fn real_mode_save(cs_base: u64) -> SaveArea {
        let mut save: SaveArea = unsafe { core::mem::zeroed() };
        save.efer = EFER_SVME;
        save.cs.base = cs_base;
        save
    }

    #[test]
    fn parses_mov_to_cr0_in_real_mode() {
        let mut mem = FakeGuestMem::new();
        // mov cr0, rbx
        mem.write(0x8000, &[0x0f, 0x22, 0xc3]);

        let save = real_mode_save(0);
        assert_eq!(parse_mov_to_cr(&save, 0x8000, 0, &[], &mem), Some(3));
    }

    #[test]
    fn applies_cs_base_outside_long_mode() {
        let mut mem = FakeGuestMem::new();
        mem.write(0xf_0000 + 0x100, &[0x0f, 0x22, 0xc0]);

        let save = real_mode_save(0xf_0000);
        assert_eq!(parse_mov_to_cr(&save, 0x100, 0, &[], &mem), Some(0));
    }

    #[test]
    fn rejects_other_opcodes() {
        let mut mem = FakeGuestMem::new();
        // mov reg, crN (0x20) instead of mov crN, reg
        mem.write(0x8000, &[0x0f, 0x20, 0xc3]);

        let save = real_mode_save(0);
        assert_eq!(parse_mov_to_cr(&save, 0x8000, 0, &[], &mem), None);
    }

    #[test]
    fn rejects_wrong_control_register() {
        let mut mem = FakeGuestMem::new();
        // mov cr4, rax
        mem.write(0x8000, &[0x0f, 0x22, 0xe0]);

        let save = real_mode_save(0);
        assert_eq!(parse_mov_to_cr(&save, 0x8000, 0, &[], &mem), None);
    }

    #[test]
    fn prefetched_bytes_bypass_the_memory_walk() {
        // nothing mapped; the hardware-captured bytes must be enough
        let mem = FakeGuestMem::new();
        let save = real_mode_save(0);
        assert_eq!(
            parse_mov_to_cr(&save, 0x8000, 0, &[0x0f, 0x22, 0xc1], &mem),
            Some(1)
        );
        assert_eq!(
            parse_mov_to_cr(&save, 0x8000, 0, &[0x0f, 0x20, 0xc1], &mem),
            None
        );
    }

    #[test]
    fn unmapped_fetch_fails() {
        let mem = FakeGuestMem::new();
        let save = real_mode_save(0);
        assert_eq!(parse_mov_to_cr(&save, 0x8000, 0, &[], &mem), None);
    }

    #[test]
    fn long_mode_walk_resolves_4k_pages() {
        let mut mem = FakeGuestMem::new();
        // One chain: pml4 @0x1000 -> pdpt @0x2000 -> pd @0x3000 -> pt @0x4000
        // mapping VA 0 to GPA 0x7000.
        mem.write_u64(0x1000, 0x2000 | PTE_PRESENT);
        mem.write_u64(0x2000, 0x3000 | PTE_PRESENT);
        mem.write_u64(0x3000, 0x4000 | PTE_PRESENT);
        mem.write_u64(0x4000, 0x7000 | PTE_PRESENT);

        let mode = GuestPagingMode::Long { root: 0x1000 };
        assert_eq!(virt_to_gphys(mode, 0x123, &mem), Some(0x7123));
        assert_eq!(virt_to_gphys(mode, 0x1000, &mem), None);
    }

    #[test]
    fn long_mode_walk_resolves_2m_pages() {
        let mut mem = FakeGuestMem::new();
        mem.write_u64(0x1000, 0x2000 | PTE_PRESENT);
        mem.write_u64(0x2000, 0x3000 | PTE_PRESENT);
        mem.write_u64(0x3000, 0x20_0000 | PTE_PRESENT | PTE_PS);

        let mode = GuestPagingMode::Long { root: 0x1000 };
        assert_eq!(virt_to_gphys(mode, 0x1_0456, &mem), Some(0x21_0456));
    }

    #[test]
    fn legacy32_walk_resolves_4m_pages() {
        let mut mem = FakeGuestMem::new();
        mem.write_u32(0x1000, (0x40_0000 | PTE_PRESENT | PTE_PS) as u32);

        let mode = GuestPagingMode::Legacy32 { root: 0x1000 };
        assert_eq!(virt_to_gphys(mode, 0x12_3456, &mem), Some(0x52_3456));
    }

    #[test]
    fn paging_mode_from_control_registers() {
        let mut save: SaveArea = unsafe { core::mem::zeroed() };

        save.efer = EFER_LMA;
        save.cr3 = 0x1234_5000;
        assert_eq!(
            GuestPagingMode::from_save_area(&save),
            Some(GuestPagingMode::Long { root: 0x1234_5000 })
        );

        save.efer = 0;
        save.cr0 = X86_CR0_PG;
        save.cr3 = 0x9000;
        assert_eq!(
            GuestPagingMode::from_save_area(&save),
            Some(GuestPagingMode::Legacy32 { root: 0x9000 })
        );

        // PAE without long mode is unsupported
        save.cr4 = X86_CR4_PAE;
        assert_eq!(GuestPagingMode::from_save_area(&save), None);

        save.cr0 = 0;
        save.cr4 = 0;
        assert_eq!(
            GuestPagingMode::from_save_area(&save),
            Some(GuestPagingMode::RealMode)
        );
    }
}
